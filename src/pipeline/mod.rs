//! Pipeline stages for document extraction.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ llm ──▶ parse ──▶ matching ──▶ aggregate
//! (store)   (pdfium)   (base64)   (VLM)   (JSON)    (projects)   (summary)
//! ```
//!
//! 1. [`input`]     — fetch source bytes from a [`input::DocumentStore`]
//! 2. [`render`]    — rasterise pages through an ordered renderer chain;
//!    runs in `spawn_blocking` because pdfium is not async-safe
//! 3. [`encode`]    — PNG-encode and base64-wrap each page image
//! 4. [`llm`]       — one vision call per page with timeout, failure
//!    classification and retry
//! 5. [`parse`]     — pull the first JSON object out of the reply
//! 6. [`matching`]  — fuzzy project match and discipline inference
//! 7. [`aggregate`] — batch pages, isolate failures, build the summary

pub mod aggregate;
pub mod encode;
pub mod input;
pub mod llm;
pub mod matching;
pub mod parse;
pub mod render;
