pub mod ekqr;

pub use ekqr::EkqrGateway;
