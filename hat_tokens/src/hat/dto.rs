//! DTOs exchanged with a HAT's token endpoints

use aliri::Jwt;
use serde::Deserialize;

/// The body returned by the owner and application token endpoints
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    /// The issued access token
    pub access_token: Jwt,
}
