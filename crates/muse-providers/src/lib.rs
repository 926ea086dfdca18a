pub mod completion;
pub mod error;
pub mod image;
pub mod mail;

pub use completion::CompletionProvider;
pub use error::ProviderError;
pub use image::{ImageProvider, StoredImage};
pub use mail::Mailer;
