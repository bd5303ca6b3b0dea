pub mod payer;

pub use payer::PayerContext;
