//! In-process test doubles
//!
//! - [`MockRepository`]: repository backend with failure injection and call
//!   recording
//! - [`MemoryImageSource`]: image store backed by byte buffers
//! - [`HttpStub`]: loopback HTTP server for exercising the real backend
//!   clients against scripted responses
//!
//! All are part of the library so integration tests and downstream crates
//! can drive the full pipeline without Docker or network access.

mod failure;
mod http;
mod image;
mod repository;

pub use failure::{FailureConfig, FailureInjector, MockOp};
pub use http::{HttpRequest, HttpResponse, HttpStub};
pub use image::MemoryImageSource;
pub use repository::{MockCall, MockRepository};
