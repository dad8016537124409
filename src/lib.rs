pub mod connector;
pub mod directory;
pub mod error;
pub mod line;
pub mod relay;
pub mod selector;
pub mod session;
pub mod supervisor;
pub mod terminal;
pub mod transport;
pub mod trust;

pub use directory::{Directory, DirectoryError};
pub use error::SessionError;
pub use supervisor::{start_session, Gateway, SessionResult};
pub use trust::TrustStore;
