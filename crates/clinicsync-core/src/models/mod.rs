//! Data models returned by the clinic scheduling backend.

pub mod profile;

pub use profile::DoctorProfile;
