//! The management sub-protocol: control frames carried in
//! [`Purpose::Management`](crate::ty::Purpose::Management) frames.
//!
//! Management frames are idempotent, carry `seq_num = 0`, and are not part of
//! the reliable sequence space. Their payload is a JSON name/value set whose
//! `Type` key selects the operation; the other keys required by each
//! operation are validated on both encode and decode.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operation selected by a management frame's `Type` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManagementType {
    /// Open a brand-new session, establishing its identity.
    RequestOpenSession,
    /// Re-bind to an existing session's state and replay held buffers.
    RequestResumeSession,
    /// Confirm an open or resume request, echoing the negotiated buffer size.
    #[serde(rename = "SessionRequestAcceptedResponse")]
    SessionRequestAccepted,
    /// Ask the peer to close the session gracefully.
    RequestCloseSession,
    /// Inform the peer that the session is gone. Once received, this is
    /// permanent: the session can never be resumed.
    NoteSessionTerminated,
    /// Diagnostic snapshot, optionally carrying the sender's held-buffer
    /// list.
    Status,
    /// Emitted when no frame has been sent for the nominal keep-alive
    /// interval.
    KeepAlive,
}

impl ManagementType {
    /// The wire name of this operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RequestOpenSession => "RequestOpenSession",
            Self::RequestResumeSession => "RequestResumeSession",
            Self::SessionRequestAccepted => "SessionRequestAcceptedResponse",
            Self::RequestCloseSession => "RequestCloseSession",
            Self::NoteSessionTerminated => "NoteSessionTerminated",
            Self::Status => "Status",
            Self::KeepAlive => "KeepAlive",
        }
    }
}

/// A management frame payload could not be encoded or decoded.
#[derive(Debug, thiserror::Error)]
pub enum MgmtError {
    /// The payload was not valid JSON for the expected shape.
    #[error("malformed management payload")]
    Json(#[from] serde_json::Error),
    /// A key required by the payload's `Type` was absent.
    #[error("management payload {ty} is missing required key {key}")]
    MissingKey {
        /// The operation name.
        ty: &'static str,
        /// The missing key.
        key: &'static str,
    },
}

/// A decoded management payload.
///
/// Only `ty` is always present; which of the other fields must be set depends
/// on the operation (see [`Management::validate`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Management {
    /// The operation.
    #[serde(rename = "Type")]
    pub ty: ManagementType,
    /// Session name.
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    /// Stable session identity; survives transport reconnects.
    #[serde(
        rename = "SessionUUID",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub session_uuid: Option<Uuid>,
    /// Identity of the client endpoint.
    #[serde(
        rename = "ClientUUID",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub client_uuid: Option<Uuid>,
    /// Instance number of the client endpoint process.
    #[serde(
        rename = "ClientInstanceNum",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub client_instance: Option<u64>,
    /// Buffer size being advertised or confirmed.
    #[serde(
        rename = "BufferSize",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub buffer_size: Option<u64>,
    /// Highest contiguously received sequence number; exchanged on resume.
    #[serde(
        rename = "LastRecvSeqNum",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub last_recv_seq: Option<u64>,
    /// Human-readable reason for a close or termination.
    #[serde(rename = "Reason", skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
    /// Sequence numbers of the sender's held buffers, for diagnostics.
    #[serde(
        rename = "HeldBufferSeqNums",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub held_buffer_seq_nums: Option<Vec<u64>>,
}

impl Management {
    fn bare(ty: ManagementType) -> Self {
        Self {
            ty,
            name: None,
            session_uuid: None,
            client_uuid: None,
            client_instance: None,
            buffer_size: None,
            last_recv_seq: None,
            reason: None,
            held_buffer_seq_nums: None,
        }
    }

    /// Builds a [`ManagementType::RequestOpenSession`].
    #[must_use]
    pub fn open(
        name: impl Into<String>,
        session_uuid: Uuid,
        client_uuid: Uuid,
        client_instance: u64,
        buffer_size: u64,
    ) -> Self {
        Self {
            name: Some(name.into()),
            session_uuid: Some(session_uuid),
            client_uuid: Some(client_uuid),
            client_instance: Some(client_instance),
            buffer_size: Some(buffer_size),
            ..Self::bare(ManagementType::RequestOpenSession)
        }
    }

    /// Builds a [`ManagementType::RequestResumeSession`].
    #[must_use]
    pub fn resume(
        name: impl Into<String>,
        session_uuid: Uuid,
        buffer_size: u64,
        last_recv_seq: u64,
    ) -> Self {
        Self {
            name: Some(name.into()),
            session_uuid: Some(session_uuid),
            buffer_size: Some(buffer_size),
            last_recv_seq: Some(last_recv_seq),
            ..Self::bare(ManagementType::RequestResumeSession)
        }
    }

    /// Builds a [`ManagementType::SessionRequestAccepted`].
    #[must_use]
    pub fn accepted(
        name: impl Into<String>,
        session_uuid: Uuid,
        buffer_size: u64,
        last_recv_seq: u64,
    ) -> Self {
        Self {
            name: Some(name.into()),
            session_uuid: Some(session_uuid),
            buffer_size: Some(buffer_size),
            last_recv_seq: Some(last_recv_seq),
            ..Self::bare(ManagementType::SessionRequestAccepted)
        }
    }

    /// Builds a [`ManagementType::RequestCloseSession`].
    #[must_use]
    pub fn close(session_uuid: Uuid) -> Self {
        Self {
            session_uuid: Some(session_uuid),
            ..Self::bare(ManagementType::RequestCloseSession)
        }
    }

    /// Builds a [`ManagementType::NoteSessionTerminated`].
    #[must_use]
    pub fn terminated(session_uuid: Option<Uuid>, reason: impl Into<String>) -> Self {
        Self {
            session_uuid,
            reason: Some(reason.into()),
            ..Self::bare(ManagementType::NoteSessionTerminated)
        }
    }

    /// Builds a [`ManagementType::Status`].
    #[must_use]
    pub fn status(held_buffer_seq_nums: Vec<u64>) -> Self {
        Self {
            held_buffer_seq_nums: Some(held_buffer_seq_nums),
            ..Self::bare(ManagementType::Status)
        }
    }

    /// Builds a [`ManagementType::KeepAlive`].
    #[must_use]
    pub fn keep_alive() -> Self {
        Self::bare(ManagementType::KeepAlive)
    }

    /// Checks that every key required by this payload's `Type` is present.
    ///
    /// # Errors
    ///
    /// Errors with the first missing key.
    pub fn validate(&self) -> Result<(), MgmtError> {
        let ty = self.ty.as_str();
        let require = |present: bool, key: &'static str| {
            if present {
                Ok(())
            } else {
                Err(MgmtError::MissingKey { ty, key })
            }
        };
        match self.ty {
            ManagementType::RequestOpenSession
            | ManagementType::RequestResumeSession
            | ManagementType::SessionRequestAccepted => {
                require(self.name.is_some(), "Name")?;
                require(self.session_uuid.is_some(), "SessionUUID")?;
                require(self.buffer_size.is_some(), "BufferSize")?;
            }
            ManagementType::NoteSessionTerminated => {
                require(self.reason.is_some(), "Reason")?;
            }
            ManagementType::Status => {
                require(self.held_buffer_seq_nums.is_some(), "HeldBufferSeqNums")?;
            }
            ManagementType::RequestCloseSession | ManagementType::KeepAlive => {}
        }
        Ok(())
    }

    /// Serializes this payload to its wire form.
    ///
    /// # Errors
    ///
    /// Errors if a required key is absent.
    pub fn encode(&self) -> Result<Vec<u8>, MgmtError> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses and validates a payload from its wire form.
    ///
    /// # Errors
    ///
    /// Errors on malformed JSON, an unknown `Type`, or a missing required
    /// key.
    pub fn decode(payload: &[u8]) -> Result<Self, MgmtError> {
        let mgmt = serde_json::from_slice::<Self>(payload)?;
        mgmt.validate()?;
        Ok(mgmt)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn round_trip_all_types() {
        let session = Uuid::new_v4();
        let client = Uuid::new_v4();
        for mgmt in [
            Management::open("s1", session, client, 1, 1024),
            Management::resume("s1", session, 1024, 17),
            Management::accepted("s1", session, 1024, 3),
            Management::close(session),
            Management::terminated(Some(session), "going away"),
            Management::status(vec![4, 5]),
            Management::keep_alive(),
        ] {
            let bytes = mgmt.encode().unwrap();
            assert_eq!(mgmt, Management::decode(&bytes).unwrap());
        }
    }

    #[test]
    fn wire_keys() {
        let mgmt = Management::open("s1", Uuid::nil(), Uuid::nil(), 1, 1024);
        let value: serde_json::Value =
            serde_json::from_slice(&mgmt.encode().unwrap()).unwrap();
        assert_eq!("RequestOpenSession", value["Type"]);
        assert_eq!("s1", value["Name"]);
        assert_eq!(1024, value["BufferSize"]);
        assert!(value.get("SessionUUID").is_some());
        assert!(value.get("Reason").is_none());

        let accepted = Management::accepted("s1", Uuid::nil(), 1024, 0);
        let value: serde_json::Value =
            serde_json::from_slice(&accepted.encode().unwrap()).unwrap();
        assert_eq!("SessionRequestAcceptedResponse", value["Type"]);
    }

    #[test]
    fn missing_required_key() {
        let mut mgmt = Management::open("s1", Uuid::nil(), Uuid::nil(), 1, 1024);
        mgmt.buffer_size = None;
        assert_matches!(
            mgmt.encode(),
            Err(MgmtError::MissingKey {
                key: "BufferSize",
                ..
            })
        );

        let bytes = br#"{"Type":"NoteSessionTerminated"}"#;
        assert_matches!(
            Management::decode(bytes),
            Err(MgmtError::MissingKey { key: "Reason", .. })
        );
    }

    #[test]
    fn unknown_type_rejected() {
        let bytes = br#"{"Type":"RequestSomethingElse"}"#;
        assert_matches!(Management::decode(bytes), Err(MgmtError::Json(_)));
    }
}
