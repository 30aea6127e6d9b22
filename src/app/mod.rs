pub mod backend;
pub mod errors;
pub mod factory;
pub mod remote;
pub mod session;

pub use factory::AppFactory;
