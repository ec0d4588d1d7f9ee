//! Mapping between local records and mirror documents
//!
//! Documents use camelCase keys. Timestamps are Unix milliseconds. The
//! password hash never leaves the local store.

use serde_json::{json, Value};

use super::identity::IdentityRequest;
use super::merge::{
    optional_bool, optional_i64, optional_str, required_str, MergeError, MergeField,
};
use super::remote::{Fields, RemoteDocument};
use crate::db::SyncRecord;
use crate::models::{
    LoginAttempt, LoginState, RecordId, Role, SyncMeta, SyncStatus, User, UserSession,
};
use crate::util::normalize_email;

/// Document key holding the origin tag
pub const SOURCE_FIELD: &str = "source";
/// Document key holding the record's last local change
pub const UPDATED_AT_FIELD: &str = "updatedAt";
/// Document key holding the writer's local id
pub const LOCAL_ID_FIELD: &str = "localId";
/// Document key referencing the owning user's document.
///
/// [`MirrorDocument::to_fields`] writes the local id; the pusher swaps in the
/// owner's mirror document id.
pub const USER_ID_FIELD: &str = "userId";

/// A record mirrored to a remote collection
pub trait MirrorDocument: SyncRecord {
    /// Remote collection name
    const COLLECTION: &'static str;

    /// Domain fields of the full-document payload
    fn to_fields(&self) -> Fields;

    /// Fields a pull may overwrite on an existing record
    fn mergeable_fields() -> Vec<MergeField<Self>>;

    /// Build a new local record from a document nobody has stored yet.
    ///
    /// `owner` is the resolved local user for documents that reference one.
    fn from_document(document: &RemoteDocument, owner: Option<RecordId>)
        -> Result<Self, MergeError>;

    /// Document key referencing the owning user, for owned records
    const OWNER_FIELD: Option<&'static str> = None;

    /// Whether a document without a resolvable owner must be skipped
    const OWNER_REQUIRED: bool = false;

    /// Natural key carried by `document`, matching [`SyncRecord::natural_key`]
    fn document_key(_document: &RemoteDocument) -> Option<String> {
        None
    }

    /// Email identifying the owning user when the owner reference does not
    /// resolve
    fn owner_email(_document: &RemoteDocument) -> Option<String> {
        None
    }

    /// Identity provisioning to run before the first push, if any
    fn identity_request(&self) -> Option<IdentityRequest> {
        None
    }

    /// Local user this record belongs to
    fn owner(&self) -> Option<&RecordId> {
        None
    }
}

/// Sync metadata for a record first seen as `document`
fn mirrored_meta(document: &RemoteDocument) -> SyncMeta {
    let updated_at = document
        .fields
        .get(UPDATED_AT_FIELD)
        .and_then(Value::as_i64)
        .unwrap_or_default();
    SyncMeta {
        local_id: RecordId::new(),
        remote_id: Some(document.id.clone()),
        sync_status: SyncStatus::Synced,
        updated_at,
        source: document
            .str_field(SOURCE_FIELD)
            .unwrap_or_default()
            .to_string(),
    }
}

fn object(value: Value) -> Fields {
    match value {
        Value::Object(fields) => fields,
        _ => Fields::new(),
    }
}

impl MirrorDocument for User {
    const COLLECTION: &'static str = "users";

    fn document_key(document: &RemoteDocument) -> Option<String> {
        document
            .str_field("email")
            .map(normalize_email)
            .filter(|email| !email.is_empty())
    }

    fn identity_request(&self) -> Option<IdentityRequest> {
        self.external_uid
            .is_none()
            .then(|| IdentityRequest::for_user(self))
    }

    fn to_fields(&self) -> Fields {
        object(json!({
            "email": self.email,
            "fullName": self.full_name,
            "phone": self.phone,
            "role": self.role.as_str(),
            "isActive": self.is_active,
            "failedLoginAttempts": self.login.failed_attempts,
            "isLocked": self.login.is_locked,
            "lockedAt": self.login.locked_at,
            "lockedUntil": self.login.locked_until,
            "lastFailedLogin": self.login.last_failed_login,
            "lastLogin": self.login.last_login,
            "externalUid": self.external_uid,
            "createdAt": self.created_at,
        }))
    }

    fn mergeable_fields() -> Vec<MergeField<Self>> {
        vec![
            MergeField::<Self>::text(
                "fullName",
                |u: &Self| u.full_name.as_deref(),
                |u, v| u.full_name = Some(v),
            ),
            MergeField::<Self>::text(
                "phone",
                |u: &Self| u.phone.as_deref(),
                |u, v| u.phone = Some(v),
            ),
            MergeField::<Self>::flag("isActive", |u: &Self| u.is_active, |u, v| u.is_active = v),
            MergeField::<Self>::count(
                "failedLoginAttempts",
                |u: &Self| u.login.failed_attempts,
                |u, v| u.login.failed_attempts = v,
            ),
            MergeField::<Self>::flag(
                "isLocked",
                |u: &Self| u.login.is_locked,
                |u, v| u.login.is_locked = v,
            ),
            MergeField::<Self>::timestamp(
                "lockedAt",
                |u: &Self| u.login.locked_at,
                |u, v| u.login.locked_at = Some(v),
            ),
            MergeField::<Self>::timestamp(
                "lockedUntil",
                |u: &Self| u.login.locked_until,
                |u, v| u.login.locked_until = Some(v),
            ),
            MergeField::<Self>::timestamp(
                "lastFailedLogin",
                |u: &Self| u.login.last_failed_login,
                |u, v| u.login.last_failed_login = Some(v),
            ),
            MergeField::<Self>::timestamp(
                "lastLogin",
                |u: &Self| u.login.last_login,
                |u, v| u.login.last_login = Some(v),
            ),
            MergeField::<Self>::text(
                "externalUid",
                |u: &Self| u.external_uid.as_deref(),
                |u, v| u.external_uid = Some(v),
            ),
        ]
    }

    fn from_document(
        document: &RemoteDocument,
        _owner: Option<RecordId>,
    ) -> Result<Self, MergeError> {
        let fields = &document.fields;
        let email = normalize_email(&required_str(fields, "email")?);
        if email.is_empty() {
            return Err(MergeError::MissingField("email"));
        }
        let role = match optional_str(fields, "role")? {
            Some(role) => role.parse().map_err(|_| MergeError::TypeMismatch {
                field: "role",
                expected: "USER or MANAGER",
            })?,
            None => Role::User,
        };
        let failed_attempts = match optional_i64(fields, "failedLoginAttempts")? {
            Some(count) => u32::try_from(count).map_err(|_| MergeError::TypeMismatch {
                field: "failedLoginAttempts",
                expected: "a non-negative integer",
            })?,
            None => 0,
        };
        let meta = mirrored_meta(document);
        let created_at = optional_i64(fields, "createdAt")?.unwrap_or(meta.updated_at);

        Ok(Self {
            meta,
            email,
            password_hash: None,
            full_name: optional_str(fields, "fullName")?,
            phone: optional_str(fields, "phone")?,
            role,
            is_active: optional_bool(fields, "isActive")?.unwrap_or(true),
            login: LoginState {
                failed_attempts,
                is_locked: optional_bool(fields, "isLocked")?.unwrap_or(false),
                locked_at: optional_i64(fields, "lockedAt")?,
                locked_until: optional_i64(fields, "lockedUntil")?,
                last_failed_login: optional_i64(fields, "lastFailedLogin")?,
                last_login: optional_i64(fields, "lastLogin")?,
            },
            external_uid: optional_str(fields, "externalUid")?,
            created_at,
        })
    }
}

impl MirrorDocument for UserSession {
    const COLLECTION: &'static str = "user_sessions";
    const OWNER_FIELD: Option<&'static str> = Some(USER_ID_FIELD);
    const OWNER_REQUIRED: bool = true;

    fn document_key(document: &RemoteDocument) -> Option<String> {
        document.str_field("sessionToken").map(str::to_string)
    }

    fn to_fields(&self) -> Fields {
        object(json!({
            USER_ID_FIELD: self.user_id.as_str(),
            "sessionToken": self.session_token,
            "refreshToken": self.refresh_token,
            "deviceInfo": self.device_info,
            "ipAddress": self.ip_address,
            "createdAt": self.created_at,
            "expiresAt": self.expires_at,
            "isValid": self.is_valid,
        }))
    }

    fn mergeable_fields() -> Vec<MergeField<Self>> {
        vec![
            MergeField::<Self>::flag("isValid", |s: &Self| s.is_valid, |s, v| s.is_valid = v),
            MergeField::<Self>::timestamp(
                "expiresAt",
                |s: &Self| Some(s.expires_at),
                |s, v| s.expires_at = v,
            ),
            MergeField::<Self>::text(
                "deviceInfo",
                |s: &Self| s.device_info.as_deref(),
                |s, v| s.device_info = Some(v),
            ),
            MergeField::<Self>::text(
                "ipAddress",
                |s: &Self| s.ip_address.as_deref(),
                |s, v| s.ip_address = Some(v),
            ),
        ]
    }

    fn from_document(
        document: &RemoteDocument,
        owner: Option<RecordId>,
    ) -> Result<Self, MergeError> {
        let fields = &document.fields;
        let user_id = owner.ok_or_else(|| MergeError::UnknownReference {
            field: USER_ID_FIELD,
            value: document.str_field(USER_ID_FIELD).unwrap_or_default().to_string(),
        })?;
        let expires_at =
            optional_i64(fields, "expiresAt")?.ok_or(MergeError::MissingField("expiresAt"))?;
        let meta = mirrored_meta(document);
        let created_at = optional_i64(fields, "createdAt")?.unwrap_or(meta.updated_at);

        Ok(Self {
            meta,
            user_id,
            session_token: required_str(fields, "sessionToken")?,
            refresh_token: required_str(fields, "refreshToken")?,
            device_info: optional_str(fields, "deviceInfo")?,
            ip_address: optional_str(fields, "ipAddress")?,
            created_at,
            expires_at,
            is_valid: optional_bool(fields, "isValid")?.unwrap_or(false),
        })
    }

    fn owner(&self) -> Option<&RecordId> {
        Some(&self.user_id)
    }
}

impl MirrorDocument for LoginAttempt {
    const COLLECTION: &'static str = "login_attempts";
    const OWNER_FIELD: Option<&'static str> = Some(USER_ID_FIELD);

    fn owner_email(document: &RemoteDocument) -> Option<String> {
        document
            .str_field("email")
            .map(normalize_email)
            .filter(|email| !email.is_empty())
    }

    fn to_fields(&self) -> Fields {
        object(json!({
            USER_ID_FIELD: self.user_id.as_ref().map(RecordId::as_str),
            "email": self.email,
            "ipAddress": self.ip_address,
            "userAgent": self.user_agent,
            "success": self.success,
            "failureReason": self.failure_reason,
            "attemptedAt": self.attempted_at,
        }))
    }

    fn mergeable_fields() -> Vec<MergeField<Self>> {
        vec![
            MergeField::<Self>::text(
                "failureReason",
                |a: &Self| a.failure_reason.as_deref(),
                |a, v| a.failure_reason = Some(v),
            ),
            MergeField::<Self>::text(
                "userAgent",
                |a: &Self| a.user_agent.as_deref(),
                |a, v| a.user_agent = Some(v),
            ),
            MergeField::<Self>::text(
                "ipAddress",
                |a: &Self| a.ip_address.as_deref(),
                |a, v| a.ip_address = Some(v),
            ),
        ]
    }

    fn from_document(
        document: &RemoteDocument,
        owner: Option<RecordId>,
    ) -> Result<Self, MergeError> {
        let fields = &document.fields;
        let meta = mirrored_meta(document);
        let attempted_at = optional_i64(fields, "attemptedAt")?.unwrap_or(meta.updated_at);

        Ok(Self {
            meta,
            user_id: owner,
            email: normalize_email(&required_str(fields, "email")?),
            ip_address: optional_str(fields, "ipAddress")?,
            user_agent: optional_str(fields, "userAgent")?,
            success: optional_bool(fields, "success")?.unwrap_or(false),
            failure_reason: optional_str(fields, "failureReason")?,
            attempted_at,
        })
    }

    fn owner(&self) -> Option<&RecordId> {
        self.user_id.as_ref()
    }
}
