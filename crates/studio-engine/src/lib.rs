pub mod batch;
pub mod client;
pub mod error;
pub mod gallery;
pub mod normalize;
pub mod panel;
pub mod source;

pub use batch::{BatchJob, BatchObserver, CancelHandle, JobState};
pub use client::{
    default_generators, CredentialChain, CredentialSource, DryrunGenerator, EnvCredentials,
    GeminiClient, GeneratorRegistry, ImageGenerator, StaticCredentials, StoreCredentials,
};
pub use error::{StudioError, StudioResult};
pub use gallery::{DirectorySink, Gallery, GalleryEntry, SaveReport, SaveSink};
pub use panel::{ArtworkSettings, MockupSettings, Panel, StatusKind, StatusMessage};
pub use source::{FileImageSource, ImageSource};
