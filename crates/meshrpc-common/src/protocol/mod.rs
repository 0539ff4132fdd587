pub mod error;
pub mod requests;
pub mod responses;


pub use error::{Result, RpcError};
pub use requests::{CorrelationId, InvokeParameters, InvokeRequest, ServiceId};
pub use responses::{InvokeResponse, InvokeResult, RemoteFault};
