//! Request-scoped audio pipeline over external tools:
//!
//! ```text
//! fetch tool (yt-dlp) ──raw audio──► transcoder (ffmpeg) ──mp3 chunks──► consumer
//! ```
//!
//! [`session::PipelineSession`] owns both processes and is the unit of
//! cancellation; [`admission::Admission`] bounds how many run at once.

pub mod admission;
pub mod error;
pub mod process;
pub mod request;
pub mod session;
pub mod source;
pub mod transcoder;

pub use admission::{Admission, Permit};
pub use error::{PipelineError, PipelineResult};
pub use request::{Bitrate, PipelineRequest, VideoId};
pub use session::{PipelineSession, PipelineSettings, SessionStats};
pub use transcoder::OutputFormat;
