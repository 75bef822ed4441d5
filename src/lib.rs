//! Single-payload RDMA flows over rdma_cm.
//!
//! A flow is one reliable connection that moves exactly one registered buffer
//! from a client to a server. The crate provides the pieces to run such flows:
//!
//! *  The connection-management handshake as an explicit state machine
//! (`handshake`) driven by `ConnectionEndpoint` and `Listener`.
//!
//! *  RAII wrappers for every rdma_cm / ibverbs object, bundled per connection
//! in `ResourceBundle`, which releases them in the reverse order of acquisition
//! on every path.
//!
//! *  `TransferEngine`, posting a single send or receive and waiting for its
//! completion by busy polling or through the completion channel.
//!
//! *  The flow orchestrator: a sequential client, a sequential port sweep on
//! the server and a concurrent server with one worker thread per queue pair.
//!
//! All hardware access goes through the `Verbs` trait. `IbVerbs` (feature
//! `ibverbs`) calls librdmacm and libibverbs, `SimVerbs` is an in-process
//! fabric used by the tests.
//!
//! #### Example
//! A server receives one 64 byte buffer on the default port while a client
//! sends it, both on the simulated fabric.
//!
//! ```
//! use rdma_flow::{
//!     config::{ClientOptionsBuilder, ServerOptionsBuilder, DEFAULT_DST_PORT},
//!     orchestrator::{run_client, serve_once},
//!     sim::SimVerbs,
//! };
//! use std::{
//!     io,
//!     net::{Ipv4Addr, SocketAddrV4},
//!     sync::Arc,
//!     thread,
//!     time::Duration,
//! };
//!
//! let verbs = Arc::new(SimVerbs::new());
//! let server = {
//!     let verbs = Arc::clone(&verbs);
//!     let opts = ServerOptionsBuilder::default().buffer_size(64).build().unwrap();
//!     thread::spawn(move || serve_once(&verbs, &opts, DEFAULT_DST_PORT))
//! };
//! let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_DST_PORT);
//! assert!(verbs.wait_for_listener(addr, Duration::from_secs(5)));
//!
//! let opts = ClientOptionsBuilder::default().buffer_size(64).build().unwrap();
//! let flows = run_client(&verbs, &opts, io::empty()).unwrap();
//! let received = server.join().unwrap().unwrap();
//! assert_eq!(flows[0].sends.len(), 1);
//! assert_eq!(received.outcome.byte_len, 64);
//! ```
#![warn(
    anonymous_parameters,
    bare_trait_objects,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    clippy::all,
    clippy::pedantic,
    clippy::missing_docs_in_private_items,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::missing_errors_doc, // every error is a `FlowError` or an `io::Error` with a step name
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing))]

/// Memory region access flags
pub mod access;
/// Command line of the binary
pub mod cli;
/// Owned cm id
mod cm_id;
/// Completion queue and work completions
pub mod completion_queue;
/// Flow descriptors and options
pub mod config;
/// Connection endpoints and listeners
pub mod connection;
/// Completion channel
mod cq_event_channel;
/// Error types
pub mod error;
/// Error logging helpers
mod error_utilities;
/// CM event channel and events
pub mod event_channel;
/// CM handshake state machine
pub mod handshake;
/// librdmacm / libibverbs backend
#[cfg(feature = "ibverbs")]
pub mod ibverbs;
/// Buffer digests and fills
pub mod integrity;
/// Memory region abstraction
mod memory_region;
/// Running client and server flows
pub mod orchestrator;
/// Protection Domain
mod protection_domain;
/// Queue Pair
mod queue_pair;
/// Resources of one connection
pub mod resource;
/// Simulated fabric
pub mod sim;
/// Single send / receive with completion wait
pub mod transfer;
/// The rdma_cm / ibverbs seam
pub mod verbs;
/// Work Request wrapper
pub mod work_request;

pub use connection::{ConnectionEndpoint, Listener};
pub use error::{ConfigError, ErrorKind, FlowError};
pub use handshake::HandshakeState;
#[cfg(feature = "ibverbs")]
pub use ibverbs::IbVerbs;
pub use memory_region::{MemoryRegion, MrAccess, MrBuffer};
pub use resource::{BundleConfig, ResourceBundle};
pub use sim::SimVerbs;
pub use transfer::{TransferEngine, WaitStrategy, WorkOutcome};
pub use verbs::Verbs;
