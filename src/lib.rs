pub mod app;
pub mod runtime;
pub mod shutdown;
