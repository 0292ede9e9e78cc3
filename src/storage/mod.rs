//! SQLite-backed persistence for settings and the saved login.

mod preferences;
mod schema;
mod settings;
mod types;

pub use schema::Database;
pub use settings::{Credentials, Settings, ThemeMode, ViewType, CREDENTIALS_KEY, SETTINGS_KEY};
pub use types::DatabaseError;
