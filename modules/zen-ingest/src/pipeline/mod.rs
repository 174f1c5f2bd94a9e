pub mod creator;
pub mod dedup;
pub mod filter;
pub mod normalize;
pub mod processor;
