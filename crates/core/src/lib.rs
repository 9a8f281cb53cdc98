pub mod asset;
pub mod credentials;
pub mod record;

pub use asset::{collect_images, is_supported_image, AssetError, ImageAsset, VALID_EXTENSIONS};
pub use credentials::{
    Credentials, CredentialError, ServiceAccountKey, GCV_ENV, OPENAI_ENV, OPENAI_KEY_PREFIX,
};
pub use record::{ExtractedRecord, CSV_HEADER};
