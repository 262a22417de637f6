pub mod answer;
pub mod document;
pub mod error;
pub mod key;
pub mod reduce;
pub mod view;

pub use document::*;
pub use error::*;
pub use key::{decode, encode, key_from_json, key_to_json, EncodedKey, Key, KeyPart};
pub use reduce::*;
pub use view::*;
