mod decoder;
mod flow_table;
mod interfaces;
mod raw_source;
mod source;

pub use decoder::{try_parse_request, try_parse_response};
pub use flow_table::{FlowTable, RequestContext, ServiceTag, FLOW_IDLE_TIMEOUT};
pub use interfaces::select_interfaces;
pub use raw_source::{start_with_fallback, RawSocketPacketSource};
pub use source::{DatalinkPacketSource, WATCHED_PORTS};
