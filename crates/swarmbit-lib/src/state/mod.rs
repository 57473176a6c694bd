mod download;
mod requester;
mod torrent;
mod upload;

pub use download::DownloadSession;
pub use requester::{BlockRequester, TickOutcome};
pub use torrent::{SessionHandle, SessionState, TorrentSession};
pub use upload::UploadJob;
