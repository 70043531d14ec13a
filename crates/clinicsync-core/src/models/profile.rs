//! The signed-in doctor's profile.

use serde::{Deserialize, Serialize};

use crate::auth::SessionUpdate;

/// Response of `GET /doctors/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct DoctorProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

impl DoctorProfile {
    /// Authorization flags this profile implies for the session.
    pub fn session_update(&self) -> SessionUpdate {
        SessionUpdate {
            is_admin: Some(self.is_admin),
            doctor_id: Some(self.id.clone()),
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            self.email.as_deref().unwrap_or(&self.id)
        } else {
            &self.name
        }
    }
}
