pub mod channels;
pub mod codec;
pub mod compiler;
pub mod controller;
pub mod hardware;
pub mod modules;
pub mod protocol;
pub mod session;
pub mod state_machine;
pub mod transport;
pub mod trial;

pub use channels::*;
pub use codec::*;
pub use compiler::*;
pub use controller::*;
pub use hardware::*;
pub use modules::*;
pub use protocol::*;
pub use session::*;
pub use state_machine::*;
pub use transport::*;
pub use trial::*;
