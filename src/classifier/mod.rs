/// Versioned table classification map: profiles, helper names, identity lookup.
pub mod classification;
/// Policy purposes each profile requires and their deterministic names.
pub mod purpose;
/// Shape recognizers deciding whether an existing policy serves a purpose.
pub mod recognizers;
