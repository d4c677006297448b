//! Building blocks for [`clap`]-driven configs.
//!
//! The blocks are meant to be flattened (`#[clap(flatten)]`) into the command
//! line of whichever application embeds the region key-value client.

pub mod batching;
