//! secmeta annotate: reconcile scan results onto image and pod metadata.
//!
//! Each tick fetches aggregate results, matches them against a resource cache,
//! builds desired labels and annotations with an [`AnnotationPolicy`] and
//! patches only resources whose metadata an [`EqualityPolicy`] finds out of date.
//! Resources are never created; only metadata of cached objects is touched.

#![forbid(unsafe_code)]

mod annotator;
pub mod policy;

pub use annotator::{plan_patch, Annotate, Desired, ImageAnnotator, PeriodicAnnotator, PodAnnotator, TickReport, DIGEST_INDEX};
pub use policy::{
    sanitize_label_value, AnnotationPolicy, BlackduckPolicy, EqualityPolicy, ExactContains, Flavor, ImageFacts, PlatformPolicy, PodFacts, Policies,
    RecordAwareContains, Slot,
};
