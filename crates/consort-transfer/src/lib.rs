//! # consort-transfer
//!
//! File channel between consort nodes.
//!
//! Results too large for a control message travel as a gzip'd tar archive
//! split into numbered chunks ([`archive_directory`]). Clients upload their
//! chunks to the remote's `/transfer` endpoint ([`TransferServer`]) and
//! download the remote's chunks from it ([`TransferClient`]); the receiver
//! reassembles and unpacks them ([`extract_parts`]).

mod archive;
mod client;
mod error;
mod server;

pub use archive::{
    archive_directory, archive_directory_async, extract_parts, extract_parts_async,
    list_entries, part_index, DEFAULT_CHUNK_SIZE,
};
pub use client::{TransferClient, DEFAULT_BASE_DELAY};
pub use error::TransferError;
pub use server::{router, TransferHandler, TransferServer, MAX_UPLOAD_BYTES};
