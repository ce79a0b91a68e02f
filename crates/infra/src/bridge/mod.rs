//! The correlation bridge between job workers and the message broker.

pub mod handlers;
pub mod inbound;
pub mod outbound;
pub mod registry;
pub mod responder;

pub use handlers::{ERROR_HANDLER, GENERATE_REQUEST_ID, GenerateRequestId, Outcome, ResponseLogger, SUCCESS_HANDLER};
pub use inbound::{Disposition, DropReason, InboundBridge, InboundConfig};
pub use outbound::{OutboundBridge, OutboundConfig};
pub use registry::{CorrelationRecord, CorrelationRegistry};
pub use responder::{EchoProcessor, RequestProcessor, Responder, ResponderConfig};
