//! Connection admission. A terminal opens its socket with three query parameters,
//! `public_key`, `terminal_id` and `signature`, and the host checks them before
//! completing the upgrade. Nothing else is exchanged before admission.

use url::form_urlencoded;

use crate::envelope::HOST_TERMINAL_ID;
use crate::identity::{self, Keypair, PublicKey, Signature, CHALLENGE};

/// Current protocol version. Optional on the query string; absent means current.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upgrade refused: missing, malformed or invalid credentials.
pub const CODE_UNAUTHORIZED: u16 = 401;

/// Upgrade refused: unsupported protocol version.
pub const CODE_UPGRADE_REQUIRED: u16 = 426;

/// Response header naming the host on a successful upgrade.
pub const HOST_ID_HEADER: &str = "x-termnet-host";

/// What a terminal presents when it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub public_key: PublicKey,
    pub terminal_id: String,
    pub signature: Signature,
    pub protocol_version: Option<u8>,
}

impl ConnectParams {
    pub fn sign(keypair: &Keypair, terminal_id: &str) -> Self {
        Self {
            public_key: *keypair.public_key(),
            terminal_id: terminal_id.to_string(),
            signature: keypair.sign_challenge(),
            protocol_version: Some(PROTOCOL_VERSION),
        }
    }

    /// Form-encoded query string, without the leading `?`.
    pub fn to_query(&self) -> String {
        let mut q = form_urlencoded::Serializer::new(String::new());
        q.append_pair("public_key", &self.public_key.to_string());
        q.append_pair("terminal_id", &self.terminal_id);
        q.append_pair("signature", &self.signature.to_string());
        if let Some(v) = self.protocol_version {
            q.append_pair("protocol_version", &v.to_string());
        }
        q.finish()
    }

    pub fn from_query(query: &str) -> Result<Self, AdmissionError> {
        let mut public_key = None;
        let mut terminal_id = None;
        let mut signature = None;
        let mut version = None;
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "public_key" => public_key = Some(value.into_owned()),
                "terminal_id" => terminal_id = Some(value.into_owned()),
                "signature" => signature = Some(value.into_owned()),
                "protocol_version" => version = Some(value.into_owned()),
                _ => {}
            }
        }
        let public_key = public_key
            .ok_or(AdmissionError::Missing("public_key"))?
            .parse()
            .map_err(|_| AdmissionError::Malformed("public_key"))?;
        let signature = signature
            .ok_or(AdmissionError::Missing("signature"))?
            .parse()
            .map_err(|_| AdmissionError::Malformed("signature"))?;
        let terminal_id = terminal_id.ok_or(AdmissionError::Missing("terminal_id"))?;
        let protocol_version = match version {
            None => None,
            Some(v) => Some(
                v.parse()
                    .map_err(|_| AdmissionError::Malformed("protocol_version"))?,
            ),
        };
        Ok(Self {
            public_key,
            terminal_id,
            signature,
            protocol_version,
        })
    }

    /// On success returns the realm key and the terminal id.
    pub fn verify(&self) -> Result<(PublicKey, String), AdmissionError> {
        if let Some(v) = self.protocol_version {
            if v != PROTOCOL_VERSION {
                return Err(AdmissionError::Version(v));
            }
        }
        if self.terminal_id.is_empty() || self.terminal_id == HOST_TERMINAL_ID {
            return Err(AdmissionError::InvalidTerminalId);
        }
        if !identity::verify(&self.public_key, CHALLENGE, &self.signature) {
            return Err(AdmissionError::BadSignature);
        }
        Ok((self.public_key, self.terminal_id.clone()))
    }
}

/// Check the query string of an upgrade request.
pub fn admit_query(query: Option<&str>) -> Result<(PublicKey, String), AdmissionError> {
    ConnectParams::from_query(query.unwrap_or_default())?.verify()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("missing `{0}` parameter")]
    Missing(&'static str),
    #[error("malformed `{0}` parameter")]
    Malformed(&'static str),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("terminal_id is empty or reserved")]
    InvalidTerminalId,
    #[error("signature is invalid")]
    BadSignature,
}

impl AdmissionError {
    /// HTTP status the upgrade is refused with.
    pub fn code(&self) -> u16 {
        match self {
            AdmissionError::Version(_) => CODE_UPGRADE_REQUIRED,
            _ => CODE_UNAUTHORIZED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_params_admitted() {
        let kp = Keypair::generate();
        let query = ConnectParams::sign(&kp, "T1").to_query();
        let (key, id) = admit_query(Some(&query)).unwrap();
        assert_eq!(key, *kp.public_key());
        assert_eq!(id, "T1");
    }

    #[test]
    fn bare_three_parameters_are_enough() {
        let kp = Keypair::generate();
        let query = format!(
            "public_key={}&terminal_id=T1&signature={}",
            kp.public_key(),
            kp.sign_challenge()
        );
        assert!(admit_query(Some(&query)).is_ok());
    }

    #[test]
    fn derived_ids_survive_encoding() {
        let kp = Keypair::generate();
        let id = identity::derive_terminal_id("okx feed", 3);
        let query = ConnectParams::sign(&kp, &id).to_query();
        assert!(!query.contains('/'));
        assert_eq!(admit_query(Some(&query)).unwrap().1, id);
    }

    #[test]
    fn signature_from_other_key_unauthorized() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let mut params = ConnectParams::sign(&kp, "T1");
        params.signature = other.sign_challenge();
        let err = admit_query(Some(&params.to_query())).unwrap_err();
        assert_eq!(err, AdmissionError::BadSignature);
        assert_eq!(err.code(), CODE_UNAUTHORIZED);
    }

    #[test]
    fn missing_and_garbled_parameters_unauthorized() {
        assert_eq!(admit_query(None), Err(AdmissionError::Missing("public_key")));
        let kp = Keypair::generate();
        let query = format!("public_key={}&terminal_id=T1", kp.public_key());
        assert_eq!(admit_query(Some(&query)), Err(AdmissionError::Missing("signature")));
        let query = format!("public_key=zz&terminal_id=T1&signature={}", kp.sign_challenge());
        let err = admit_query(Some(&query)).unwrap_err();
        assert_eq!(err, AdmissionError::Malformed("public_key"));
        assert_eq!(err.code(), CODE_UNAUTHORIZED);
    }

    #[test]
    fn reserved_and_empty_ids_refused() {
        let kp = Keypair::generate();
        for id in ["", "@host"] {
            let query = ConnectParams::sign(&kp, id).to_query();
            assert_eq!(admit_query(Some(&query)), Err(AdmissionError::InvalidTerminalId));
        }
    }

    #[test]
    fn version_mismatch_is_426() {
        let kp = Keypair::generate();
        let mut params = ConnectParams::sign(&kp, "T1");
        params.protocol_version = Some(PROTOCOL_VERSION + 1);
        let err = admit_query(Some(&params.to_query())).unwrap_err();
        assert_eq!(err.code(), CODE_UPGRADE_REQUIRED);
    }
}
