mod client;
mod remote;
mod types;

pub use client::{ApiErrorClass, DriveClient, DriveError};
pub use reqwest::StatusCode;
pub use remote::{ByteStream, RemoteDrive};
pub use types::{AccountCursor, Change, ChangeList, DriveItem, FOLDER_MIME_TYPE, Labels, ParentRef};
