pub mod artifact;

pub use artifact::{
    artifact_path, collect_artifacts, combine_artifacts, read_record_artifact, write_record_artifact,
    ArtifactError, CombineSummary,
};
