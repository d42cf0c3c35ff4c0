pub mod api_key;
pub mod crypto;
pub mod error;
pub mod scheduled_executor;

pub use api_key::{create_api_key, delete_api_key, list_api_keys, verify_api_key, ApiKey};
pub use crypto::EncryptionSettings;
pub use error::{CoreError, CoreResult};
pub use scheduled_executor::{ScheduledExecutor, ScheduledTask};
