//! Pipeline stages for article and image transcoding.
//!
//! Each submodule implements exactly one transformation step, so each can
//! be tested on its own and the coordination logic in [`crate::proxy`]
//! stays free of format details.
//!
//! ## Data Flow
//!
//! ```text
//! article: fetch ──▶ simplify ──▶ emit
//!          (HTTP)    (html5ever)  (HTML 3.2)
//!
//! image:   fetch ──▶ decode ──▶ quantize ──▶ transcode
//!          (HTTP)    (sniffed)  (median cut) (GIF/LZW)
//! ```
//!
//! 1. [`fetch`]: the [`fetch::Upstream`] seam and its HTTP implementation;
//!    the only stage with network I/O
//! 2. [`simplify`]: tolerant parse into the closed [`crate::document`] tree;
//!    runs in `spawn_blocking` because `scraper::Html` is `!Send`
//! 3. [`emit`]: deterministic serialisation to the legacy subset
//! 4. [`decode`]: one decoder per source format, chosen by magic bytes
//! 5. [`quantize`]: median-cut palette reduction with optional dithering
//! 6. [`transcode`]: resize, quantize and GIF-encode; CPU-bound, runs in
//!    `spawn_blocking` under a timeout

pub mod decode;
pub mod emit;
pub mod fetch;
pub mod quantize;
pub mod simplify;
pub mod transcode;
