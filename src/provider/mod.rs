//! Provides attached media (local or downloading) to the repo/preload
//! workflows, deduplicating concurrent requests for the same medium and
//! driving the user-facing media-change dialogue on failure.

pub mod media;

pub use media::{
    select_volatile_device, AbortOnProblem, LazyMediaHandle, MediaChangeAction, MediaChangeCallback,
    MediaChangeReason, MediaHandle, MediaProvider, MediumAttacher, ProvideFileSpec, ProvideMediaSpec,
    ProvideRes, VolatileDeviceSource,
};
