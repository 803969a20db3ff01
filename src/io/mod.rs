pub mod http;
pub mod remote;
pub mod store;
pub mod workbook_read;
pub mod workbook_write;
