pub mod error;
pub mod route;
pub mod transport;

pub use error::{Result, RouteError};
pub use route::{PartyRoute, Protocol, RouteTable};
pub use transport::HttpTransport;
