//! Demultiplexing and decoding for ARIB (ISDB-T/S) MPEG-2 transport streams.
//!
//! # Usage
//! Simply add this crate as a dependency in your `Cargo.toml`.
//!
//! ```toml
//! [dependencies]
//! isdb-core = "~0.1.0"
//! ```
//!
//! # Layout
//! - [`packet`] / [`framer`]: packet-header parsing and byte-stream resynchronization.
//! - [`pidmap`]: per-PID routing into section reassembly, PCR tracking, or ES byte counts.
//! - [`section`] / [`table`]: section header framing and PSI/SI table decoders (PAT, CAT,
//!   PMT, NIT, SDT, EIT, TOT).
//! - [`descriptor`]: descriptor-loop decoding shared by the table parsers.
//! - [`aribstr`]: ARIB 8-bit character string decoding to UTF-8.
//! - [`time`]: MJD+BCD time decode and TOT-anchored PCR interpolation.
//! - [`oneseg`]: one-segment PAT synthesis.
//! - [`selector`]: single-service PAT/PMT rewriting.
//! - [`analyzer`]: aggregated service/network model built from decoded tables.
//! - [`epg`]: EIT merge into a queryable EPG database.
//! - [`config`] / [`pipeline`]: runtime tuning and the filter-graph runtime that ties all
//!   of the above into one streaming pipeline.

#![allow(unused)]
#![deny(missing_docs, unsafe_code, warnings)]

pub mod error;

mod slice_reader;
pub use slice_reader::SliceReader;

pub mod packet;
pub mod framer;
pub mod pidmap;
pub mod section;
pub mod table;
pub mod aribstr;
pub mod descriptor;
pub mod time;
pub mod oneseg;
pub mod selector;
pub mod analyzer;
pub mod epg;
pub mod config;
pub mod pipeline;
