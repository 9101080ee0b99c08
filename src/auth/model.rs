use serde::Deserialize;
use std::collections::HashMap;

use crate::model::Identity;

#[derive(Deserialize, Debug, Default)]
pub struct UserMetadata {
    pub full_name: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub picture: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct UserResponse {
    pub id: String,
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

impl UserResponse {
    pub fn into_identity(self) -> Identity {
        let meta = self.user_metadata;
        Identity {
            id: self.id,
            email: self.email.unwrap_or_default(),
            display_name: meta.full_name.or(meta.name).filter(|n| !n.trim().is_empty()),
            avatar_url: meta.avatar_url.or(meta.picture).filter(|u| !u.trim().is_empty()),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub expires_at: Option<i64>,
    pub user: Option<UserResponse>,
}

#[derive(Deserialize, Debug, Default)]
pub struct SettingsResponse {
    #[serde(default)]
    pub external: HashMap<String, bool>,
}

#[derive(Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub msg: Option<String>,
    pub message: Option<String>,
}

impl ErrorResponse {
    pub fn text(self) -> Option<String> {
        self.error_description
            .or(self.msg)
            .or(self.message)
            .or(self.error)
    }
}
