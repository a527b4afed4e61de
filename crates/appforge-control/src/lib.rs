pub mod api_error;
pub mod logs_ws;
pub mod preview;
pub mod request_meta;
pub mod routes;
pub mod state;
