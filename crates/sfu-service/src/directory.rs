//! Meeting directory: persistence and join authorization.
//!
//! The SFU does not own meeting records. `MeetingDirectory` is the seam to
//! whatever stores meetings and participants; it decides whether a user may
//! join (meeting status, password, capacity) and records who is active.
//!
//! `InMemoryDirectory` is the bundled implementation. With auto-provisioning
//! enabled, joining an unknown meeting id creates an open meeting whose first
//! joiner becomes host.

use crate::errors::SfuError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Authenticated user, as established by the signaling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParticipantRole {
    Host,
    CoHost,
    Participant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingStatus {
    Scheduled,
    Active,
    Ended,
}

/// Client-visible meeting record. The password hash never leaves the
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingRecord {
    pub id: String,
    pub title: String,
    pub host_id: String,
    pub status: MeetingStatus,
    pub max_participants: usize,
    pub has_password: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub id: String,
    pub meeting_id: String,
    pub user_id: String,
    pub display_name: String,
    pub role: ParticipantRole,
    pub is_muted: bool,
    pub is_video_on: bool,
    pub is_screen_sharing: bool,
    pub is_hand_raised: bool,
    pub joined_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_at: Option<DateTime<Utc>>,
}

impl ParticipantRecord {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }

    fn apply(&mut self, updates: &ParticipantUpdates) {
        if let Some(v) = updates.is_muted {
            self.is_muted = v;
        }
        if let Some(v) = updates.is_video_on {
            self.is_video_on = v;
        }
        if let Some(v) = updates.is_screen_sharing {
            self.is_screen_sharing = v;
        }
        if let Some(v) = updates.is_hand_raised {
            self.is_hand_raised = v;
        }
    }
}

/// Partial participant status change; only set fields are applied and sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_video_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_hand_raised: Option<bool>,
}

/// Result of an authorized join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGrant {
    pub meeting: MeetingRecord,
    pub participant: ParticipantRecord,
}

/// Settings for `InMemoryDirectory::register_meeting`.
#[derive(Debug, Clone, Default)]
pub struct MeetingSettings {
    pub meeting_id: Option<String>,
    pub title: String,
    pub host_id: String,
    pub max_participants: Option<usize>,
    pub password: Option<String>,
    /// Scheduled meetings become active when their host joins.
    pub scheduled: bool,
}

/// Meeting and participant persistence plus join authorization.
#[async_trait]
pub trait MeetingDirectory: Send + Sync {
    /// Authorize `user` for `meeting_id` and record the participant.
    ///
    /// A user that is already active in the meeting gets its existing
    /// participant record back.
    async fn join(
        &self,
        meeting_id: &str,
        user: &UserIdentity,
        password: Option<&str>,
    ) -> Result<JoinGrant, SfuError>;

    /// Record that the participant left. Idempotent.
    async fn mark_left(&self, meeting_id: &str, participant_id: &str) -> Result<(), SfuError>;

    async fn active_participants(&self, meeting_id: &str)
        -> Result<Vec<ParticipantRecord>, SfuError>;

    async fn update_participant(
        &self,
        meeting_id: &str,
        participant_id: &str,
        updates: &ParticipantUpdates,
    ) -> Result<ParticipantRecord, SfuError>;

    /// Mark the meeting ended and every active participant left.
    async fn end_meeting(&self, meeting_id: &str) -> Result<(), SfuError>;
}

struct MeetingEntry {
    record: MeetingRecord,
    password_hash: Option<String>,
    participants: HashMap<String, ParticipantRecord>,
}

impl MeetingEntry {
    fn active_count(&self) -> usize {
        self.participants.values().filter(|p| p.is_active()).count()
    }
}

/// In-process `MeetingDirectory`.
pub struct InMemoryDirectory {
    meetings: RwLock<HashMap<String, MeetingEntry>>,
    auto_provision: bool,
    default_max_participants: usize,
    bcrypt_cost: u32,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new(auto_provision: bool, default_max_participants: usize) -> Self {
        Self {
            meetings: RwLock::new(HashMap::new()),
            auto_provision,
            default_max_participants,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }

    /// Override the bcrypt cost used for meeting passwords.
    #[must_use]
    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    /// Create a meeting.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if password hashing fails.
    pub async fn register_meeting(&self, settings: MeetingSettings) -> Result<MeetingRecord, SfuError> {
        let password_hash = match settings.password {
            Some(password) => Some(hash_password(password, self.bcrypt_cost).await?),
            None => None,
        };

        let record = MeetingRecord {
            id: settings
                .meeting_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            title: settings.title,
            host_id: settings.host_id,
            status: if settings.scheduled {
                MeetingStatus::Scheduled
            } else {
                MeetingStatus::Active
            },
            max_participants: settings
                .max_participants
                .unwrap_or(self.default_max_participants),
            has_password: password_hash.is_some(),
            created_at: Utc::now(),
        };

        info!(
            target: "sfu.directory",
            meeting_id = %record.id,
            protected = record.has_password,
            "Meeting registered"
        );

        self.meetings.write().await.insert(
            record.id.clone(),
            MeetingEntry {
                record: record.clone(),
                password_hash,
                participants: HashMap::new(),
            },
        );
        Ok(record)
    }

    /// Current meeting record, if any.
    pub async fn meeting(&self, meeting_id: &str) -> Option<MeetingRecord> {
        self.meetings
            .read()
            .await
            .get(meeting_id)
            .map(|m| m.record.clone())
    }
}

#[async_trait]
impl MeetingDirectory for InMemoryDirectory {
    async fn join(
        &self,
        meeting_id: &str,
        user: &UserIdentity,
        password: Option<&str>,
    ) -> Result<JoinGrant, SfuError> {
        // Password verification is slow; do it before taking the write lock.
        let password_hash = {
            let meetings = self.meetings.read().await;
            match meetings.get(meeting_id) {
                Some(entry) if entry.record.status == MeetingStatus::Ended => {
                    return Err(SfuError::MeetingEnded);
                }
                Some(entry) => entry.password_hash.clone(),
                None if self.auto_provision => None,
                None => return Err(SfuError::MeetingNotFound(meeting_id.to_string())),
            }
        };
        if let Some(hash) = password_hash {
            verify_password(password.unwrap_or_default().to_string(), hash).await?;
        }

        let mut meetings = self.meetings.write().await;
        let entry = meetings.entry(meeting_id.to_string()).or_insert_with(|| {
            debug!(
                target: "sfu.directory",
                meeting_id = %meeting_id,
                "Auto-provisioning meeting"
            );
            MeetingEntry {
                record: MeetingRecord {
                    id: meeting_id.to_string(),
                    title: meeting_id.to_string(),
                    host_id: user.user_id.clone(),
                    status: MeetingStatus::Active,
                    max_participants: self.default_max_participants,
                    has_password: false,
                    created_at: Utc::now(),
                },
                password_hash: None,
                participants: HashMap::new(),
            }
        });

        // The meeting may have ended while the password was being checked.
        if entry.record.status == MeetingStatus::Ended {
            return Err(SfuError::MeetingEnded);
        }

        if let Some(existing) = entry
            .participants
            .values()
            .find(|p| p.user_id == user.user_id && p.is_active())
        {
            debug!(
                target: "sfu.directory",
                meeting_id = %meeting_id,
                participant_id = %existing.id,
                "User rejoining meeting"
            );
            return Ok(JoinGrant {
                meeting: entry.record.clone(),
                participant: existing.clone(),
            });
        }

        if entry.active_count() >= entry.record.max_participants {
            return Err(SfuError::MeetingFull);
        }

        let role = if user.user_id == entry.record.host_id {
            ParticipantRole::Host
        } else {
            ParticipantRole::Participant
        };
        if role == ParticipantRole::Host && entry.record.status == MeetingStatus::Scheduled {
            entry.record.status = MeetingStatus::Active;
        }

        let participant = ParticipantRecord {
            id: Uuid::new_v4().to_string(),
            meeting_id: meeting_id.to_string(),
            user_id: user.user_id.clone(),
            display_name: user.display_name.clone(),
            role,
            is_muted: false,
            is_video_on: true,
            is_screen_sharing: false,
            is_hand_raised: false,
            joined_at: Utc::now(),
            left_at: None,
        };
        entry
            .participants
            .insert(participant.id.clone(), participant.clone());

        info!(
            target: "sfu.directory",
            meeting_id = %meeting_id,
            participant_id = %participant.id,
            active = entry.active_count(),
            "Participant admitted"
        );

        Ok(JoinGrant {
            meeting: entry.record.clone(),
            participant,
        })
    }

    async fn mark_left(&self, meeting_id: &str, participant_id: &str) -> Result<(), SfuError> {
        let mut meetings = self.meetings.write().await;
        let Some(participant) = meetings
            .get_mut(meeting_id)
            .and_then(|m| m.participants.get_mut(participant_id))
        else {
            warn!(
                target: "sfu.directory",
                meeting_id = %meeting_id,
                participant_id = %participant_id,
                "mark_left for unknown participant"
            );
            return Ok(());
        };
        if participant.left_at.is_none() {
            participant.left_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn active_participants(
        &self,
        meeting_id: &str,
    ) -> Result<Vec<ParticipantRecord>, SfuError> {
        let meetings = self.meetings.read().await;
        let entry = meetings
            .get(meeting_id)
            .ok_or_else(|| SfuError::MeetingNotFound(meeting_id.to_string()))?;
        let mut active: Vec<ParticipantRecord> = entry
            .participants
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(active)
    }

    async fn update_participant(
        &self,
        meeting_id: &str,
        participant_id: &str,
        updates: &ParticipantUpdates,
    ) -> Result<ParticipantRecord, SfuError> {
        let mut meetings = self.meetings.write().await;
        let participant = meetings
            .get_mut(meeting_id)
            .ok_or_else(|| SfuError::MeetingNotFound(meeting_id.to_string()))?
            .participants
            .get_mut(participant_id)
            .filter(|p| p.is_active())
            .ok_or(SfuError::NotAMember)?;
        participant.apply(updates);
        Ok(participant.clone())
    }

    async fn end_meeting(&self, meeting_id: &str) -> Result<(), SfuError> {
        let mut meetings = self.meetings.write().await;
        let entry = meetings
            .get_mut(meeting_id)
            .ok_or_else(|| SfuError::MeetingNotFound(meeting_id.to_string()))?;
        entry.record.status = MeetingStatus::Ended;
        let now = Utc::now();
        for participant in entry.participants.values_mut() {
            if participant.left_at.is_none() {
                participant.left_at = Some(now);
            }
        }
        info!(target: "sfu.directory", meeting_id = %meeting_id, "Meeting ended");
        Ok(())
    }
}

async fn hash_password(password: String, cost: u32) -> Result<String, SfuError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| SfuError::Internal(format!("password hashing task failed: {e}")))?
        .map_err(|e| SfuError::Internal(format!("password hashing failed: {e}")))
}

async fn verify_password(password: String, hash: String) -> Result<(), SfuError> {
    let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| SfuError::Internal(format!("password verification task failed: {e}")))?
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(SfuError::InvalidPassword)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // Minimum bcrypt cost keeps the tests fast.
    const TEST_COST: u32 = 4;

    fn user(id: &str) -> UserIdentity {
        UserIdentity {
            user_id: id.to_string(),
            display_name: format!("User {id}"),
        }
    }

    fn directory(auto_provision: bool) -> InMemoryDirectory {
        InMemoryDirectory::new(auto_provision, 10).with_bcrypt_cost(TEST_COST)
    }

    #[tokio::test]
    async fn test_unknown_meeting_rejected_without_auto_provision() {
        let dir = directory(false);
        let result = dir.join("nope", &user("alice"), None).await;
        assert!(matches!(result, Err(SfuError::MeetingNotFound(_))));
    }

    #[tokio::test]
    async fn test_auto_provision_makes_first_joiner_host() {
        let dir = directory(true);

        let alice = dir.join("standup", &user("alice"), None).await.unwrap();
        let bob = dir.join("standup", &user("bob"), None).await.unwrap();

        assert_eq!(alice.participant.role, ParticipantRole::Host);
        assert_eq!(bob.participant.role, ParticipantRole::Participant);
        assert_eq!(alice.meeting.host_id, "alice");
    }

    #[tokio::test]
    async fn test_rejoin_returns_same_participant() {
        let dir = directory(true);
        let first = dir.join("m", &user("alice"), None).await.unwrap();
        let second = dir.join("m", &user("alice"), None).await.unwrap();
        assert_eq!(first.participant.id, second.participant.id);
        assert_eq!(dir.active_participants("m").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_password_checked() {
        let dir = directory(false);
        dir.register_meeting(MeetingSettings {
            meeting_id: Some("secret".to_string()),
            title: "Board".to_string(),
            host_id: "alice".to_string(),
            password: Some("hunter2".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        let missing = dir.join("secret", &user("bob"), None).await;
        assert_eq!(missing, Err(SfuError::InvalidPassword));

        let wrong = dir.join("secret", &user("bob"), Some("nope")).await;
        assert_eq!(wrong, Err(SfuError::InvalidPassword));

        let ok = dir.join("secret", &user("bob"), Some("hunter2")).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_meeting_full() {
        let dir = directory(false);
        dir.register_meeting(MeetingSettings {
            meeting_id: Some("small".to_string()),
            host_id: "alice".to_string(),
            max_participants: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

        let alice = dir.join("small", &user("alice"), None).await.unwrap();
        assert_eq!(
            dir.join("small", &user("bob"), None).await,
            Err(SfuError::MeetingFull)
        );

        dir.mark_left("small", &alice.participant.id).await.unwrap();
        assert!(dir.join("small", &user("bob"), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_scheduled_meeting_activated_by_host() {
        let dir = directory(false);
        dir.register_meeting(MeetingSettings {
            meeting_id: Some("later".to_string()),
            host_id: "alice".to_string(),
            scheduled: true,
            ..Default::default()
        })
        .await
        .unwrap();

        let grant = dir.join("later", &user("alice"), None).await.unwrap();
        assert_eq!(grant.meeting.status, MeetingStatus::Active);
    }

    #[tokio::test]
    async fn test_end_meeting_blocks_joins_and_marks_left() {
        let dir = directory(true);
        dir.join("m", &user("alice"), None).await.unwrap();

        dir.end_meeting("m").await.unwrap();

        assert!(dir.active_participants("m").await.unwrap().is_empty());
        assert_eq!(
            dir.join("m", &user("bob"), None).await,
            Err(SfuError::MeetingEnded)
        );
    }

    #[tokio::test]
    async fn test_update_participant_applies_only_set_fields() {
        let dir = directory(true);
        let grant = dir.join("m", &user("alice"), None).await.unwrap();

        let updated = dir
            .update_participant(
                "m",
                &grant.participant.id,
                &ParticipantUpdates {
                    is_hand_raised: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(updated.is_hand_raised);
        assert!(updated.is_video_on);
        assert!(!updated.is_muted);
    }

    #[tokio::test]
    async fn test_update_after_leave_is_not_a_member() {
        let dir = directory(true);
        let grant = dir.join("m", &user("alice"), None).await.unwrap();
        dir.mark_left("m", &grant.participant.id).await.unwrap();
        dir.mark_left("m", &grant.participant.id).await.unwrap();

        let result = dir
            .update_participant("m", &grant.participant.id, &ParticipantUpdates::default())
            .await;
        assert_eq!(result, Err(SfuError::NotAMember));
    }

    #[test]
    fn test_updates_serialize_only_set_fields() {
        let updates = ParticipantUpdates {
            is_muted: Some(true),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&updates).unwrap(),
            serde_json::json!({"isMuted": true})
        );
    }
}
