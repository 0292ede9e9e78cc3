//! Utility functions shared by the cache, the API client and the CLI.
//!
//! - **URL validation**: server base URLs and derived thumbnail links
//! - **Text processing**: HTML-to-text snippets, image extraction, and
//!   Unicode-aware truncation for terminal output

mod html;
mod text;
mod url_validator;

pub use html::{first_image_src, strip_html};
pub use text::{display_width, excerpt, truncate_to_width};
pub use url_validator::{is_web_url, validate_base_url, UrlValidationError};
