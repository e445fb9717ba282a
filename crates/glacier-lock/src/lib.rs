//! Glacier Time-Lock Module
//!
//! Self-custodial absolute time-locks on top of one HD wallet.
//!
//! # Concepts
//!
//! - **Lock script**: `<height> CLTV DROP DUP HASH160 <pkh> EQUALVERIFY CHECKSIG`,
//!   paid to through P2SH. The key is the wallet's lock-branch key at index = height.
//! - **Discovery tag**: an OP_RETURN output reading `GLACIER <height>` next to the
//!   lock output, so the wallet finds its own locks by walking its history.
//! - **Validation**: a tagged transaction counts only if re-deriving the script for
//!   the tagged height reproduces the on-chain P2SH address exactly.
//!
//! # Request pipeline
//!
//! ```text
//! ChainScanner -> LockRegistry -> TxBuilder -> Signer -> (broadcast)
//! ```
//!
//! [`wallet::Glacier`] runs the whole pipeline for one request.

pub mod draft;
pub mod registry;
pub mod scan;
pub mod script;
pub mod sign;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod wallet;

pub use draft::{
    InputTemplate, LockParams, NewLockDraft, TxBuilder, UnlockDraft, UnsignedDraft, DEFAULT_FEE,
    DEFAULT_LOCK_OFFSET,
};
pub use registry::{LockRegistry, LockStatus};
pub use scan::{ChainScanner, DerivedAddress, FundingInput, LockCandidate, ScanReport};
pub use script::LockDescriptor;
pub use sign::Signer;
pub use wallet::{Glacier, GlacierError, GlacierReport};
