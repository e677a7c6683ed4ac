pub mod errors;
pub mod events;
pub mod history;
pub mod image;
pub mod presets;
pub mod request;
pub mod resolution;

pub use errors::{
    BusyError, ConfigurationError, GenerationError, GenerationErrorKind, NotFoundError,
    ValidationError, ValidationKind,
};
pub use history::{EntryId, GenerationResult, HistoryEntry, HistoryStore};
pub use crate::image::{Image, ImageHandle, Mask};
pub use request::{GenerationMode, GenerationRequest, RequestBuilder};
pub use resolution::ResolutionTier;
