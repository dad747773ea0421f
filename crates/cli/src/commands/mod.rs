pub mod init;
pub mod state;
pub mod status;
pub mod sync;

pub use init::*;
pub use state::*;
pub use status::*;
pub use sync::*;
