use chrono::{DateTime, Utc};
use hush_types::models::{ConversationStatus, UnmaskingPhase, UnmaskingStatus};
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

use crate::models::{ConversationRow, UnmaskingRequestRow};
use crate::queries::{load_conversation, load_unmasking_request, load_unmasking_rows, query_user_by_id};
use crate::{Database, ProtocolError, format_timestamp, now, parse_timestamp};

/// Conversation-level unmasking state, derived from its request rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnmaskingState {
    None,
    Pending { requester_id: String },
    MutualPending,
    ReadyToComplete,
    Completed,
    Declined,
}

impl UnmaskingState {
    pub fn phase(&self) -> UnmaskingPhase {
        match self {
            UnmaskingState::None => UnmaskingPhase::None,
            UnmaskingState::Pending { .. } => UnmaskingPhase::Pending,
            UnmaskingState::MutualPending => UnmaskingPhase::MutualPending,
            UnmaskingState::ReadyToComplete => UnmaskingPhase::ReadyToComplete,
            UnmaskingState::Completed => UnmaskingPhase::Completed,
            UnmaskingState::Declined => UnmaskingPhase::Declined,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealedUser {
    pub user_id: String,
    pub username: String,
}

/// Result of a state-changing unmasking operation.
#[derive(Debug)]
pub struct UnmaskingOutcome {
    pub conversation_id: String,
    /// The row the operation acted on from the caller's side.
    pub request_id: String,
    pub status: UnmaskingStatus,
    /// The other participant, to notify.
    pub counterpart_id: String,
    /// Both participants, once identities are revealed.
    pub revealed: Option<[RevealedUser; 2]>,
}

impl UnmaskingOutcome {
    /// The identity `viewer` gets to see: the other participant's.
    pub fn revealed_to(&self, viewer: &str) -> Option<&RevealedUser> {
        self.revealed
            .as_ref()
            .and_then(|pair| pair.iter().find(|user| user.user_id != viewer))
    }
}

/// Unmasking state as seen by one participant.
#[derive(Debug)]
pub struct UnmaskingView {
    pub state: UnmaskingState,
    /// Inbound row the viewer may respond to.
    pub incoming_request_id: Option<String>,
    /// The viewer's own in-flight row.
    pub outgoing_request_id: Option<String>,
    /// The counterpart, only when `state` is `Completed`.
    pub revealed: Option<RevealedUser>,
}

impl Database {
    /// Ask to reveal identities. Each direction is its own row; if the other
    /// side's request is still pending, both rows become `mutual_pending`.
    pub fn request_unmasking(
        &self,
        conversation_id: &str,
        requester_id: &str,
    ) -> Result<UnmaskingOutcome, ProtocolError> {
        let retry_after = self.config().unmask_retry_after;

        let outcome = self.with_tx(|tx| {
            let conversation = active_conversation(tx, conversation_id, requester_id)?;
            let target = counterpart(&conversation, requester_id)?;
            let rows = load_unmasking_rows(tx, conversation_id)?;

            if rows.iter().any(|r| r.status == UnmaskingStatus::Completed) {
                return Err(ProtocolError::AlreadyExists("unmasking for this conversation"));
            }
            if rows
                .iter()
                .any(|r| r.requester_id == requester_id && r.status.is_live())
            {
                return Err(ProtocolError::AlreadyExists("unmasking request"));
            }
            ensure_decline_elapsed(&rows, retry_after, now())?;

            // The other side asked first and is still waiting: both want it
            let opposite = rows.iter().find(|r| {
                r.requester_id == target
                    && r.target_id == requester_id
                    && r.status == UnmaskingStatus::Pending
            });
            let status = match opposite {
                Some(row) => {
                    set_status(tx, &row.id, UnmaskingStatus::MutualPending)?;
                    UnmaskingStatus::MutualPending
                }
                None => UnmaskingStatus::Pending,
            };

            let request_id = insert_request(tx, conversation_id, requester_id, &target, status, None)?;
            Ok(UnmaskingOutcome {
                conversation_id: conversation_id.to_string(),
                request_id,
                status,
                counterpart_id: target,
                revealed: None,
            })
        })?;

        info!(
            "Unmasking requested on conversation {}: {}",
            conversation_id,
            outcome.status.as_str()
        );
        Ok(outcome)
    }

    /// Accepting while your own request toward the requester is in flight
    /// completes both rows at once. Declining halts every live row of the
    /// conversation.
    pub fn respond_to_unmasking(
        &self,
        request_id: &str,
        responder_id: &str,
        accept: bool,
    ) -> Result<UnmaskingOutcome, ProtocolError> {
        let outcome = self.with_tx(|tx| {
            let inbound = load_unmasking_request(tx, request_id)?
                .ok_or(ProtocolError::NotFound("unmasking request"))?;
            if inbound.target_id != responder_id {
                return Err(ProtocolError::Forbidden("only the target can respond to an unmasking request"));
            }
            if !matches!(
                inbound.status,
                UnmaskingStatus::Pending | UnmaskingStatus::MutualPending
            ) {
                return Err(ProtocolError::InvalidState(format!(
                    "unmasking request is {}",
                    inbound.status.as_str()
                )));
            }
            let conversation = active_conversation(tx, &inbound.conversation_id, responder_id)?;
            let responded_at = format_timestamp(now());

            if !accept {
                // Declining halts the handshake in both directions
                tx.execute(
                    "UPDATE unmasking_requests SET status = 'declined', responded_at = ?1
                     WHERE conversation_id = ?2
                       AND status IN ('pending', 'mutual_pending', 'accepted')",
                    [&responded_at, &inbound.conversation_id],
                )?;
                return Ok(UnmaskingOutcome {
                    conversation_id: inbound.conversation_id,
                    request_id: inbound.id,
                    status: UnmaskingStatus::Declined,
                    counterpart_id: inbound.requester_id,
                    revealed: None,
                });
            }

            let rows = load_unmasking_rows(tx, &inbound.conversation_id)?;
            let own = rows.iter().find(|r| {
                r.requester_id == responder_id
                    && r.target_id == inbound.requester_id
                    && matches!(
                        r.status,
                        UnmaskingStatus::Pending | UnmaskingStatus::MutualPending
                    )
            });

            let status = match own {
                Some(own) => {
                    // Both sides already asked: accepting settles it
                    tx.execute(
                        "UPDATE unmasking_requests SET responded_at = ?1 WHERE id = ?2",
                        [&responded_at, &inbound.id],
                    )?;
                    complete_rows(tx, &[inbound.id.as_str(), own.id.as_str()])?;
                    UnmaskingStatus::Completed
                }
                None => {
                    tx.execute(
                        "UPDATE unmasking_requests SET status = 'accepted', responded_at = ?1
                         WHERE id = ?2",
                        [&responded_at, &inbound.id],
                    )?;
                    insert_request(
                        tx,
                        &inbound.conversation_id,
                        responder_id,
                        &inbound.requester_id,
                        UnmaskingStatus::Accepted,
                        Some(&responded_at),
                    )?;
                    UnmaskingStatus::Accepted
                }
            };

            let revealed = match status {
                UnmaskingStatus::Completed => Some(reveal(tx, &conversation)?),
                _ => None,
            };
            Ok(UnmaskingOutcome {
                conversation_id: inbound.conversation_id,
                request_id: inbound.id,
                status,
                counterpart_id: inbound.requester_id,
                revealed,
            })
        })?;

        info!(
            "Unmasking request {} answered on conversation {}: {}",
            request_id,
            outcome.conversation_id,
            outcome.status.as_str()
        );
        Ok(outcome)
    }

    /// Finalise a handshake both sides have consented to, either through an
    /// accept (two accepted rows) or a race (two mutual_pending rows).
    pub fn complete_unmasking(
        &self,
        conversation_id: &str,
        caller_id: &str,
    ) -> Result<UnmaskingOutcome, ProtocolError> {
        let outcome = self.with_tx(|tx| {
            let conversation = active_conversation(tx, conversation_id, caller_id)?;
            let target = counterpart(&conversation, caller_id)?;
            let rows = load_unmasking_rows(tx, conversation_id)?;

            let ready: Vec<&UnmaskingRequestRow> = rows
                .iter()
                .filter(|r| {
                    matches!(
                        r.status,
                        UnmaskingStatus::Accepted | UnmaskingStatus::MutualPending
                    )
                })
                .collect();
            if ready.len() < 2 {
                return Err(ProtocolError::InvalidState(
                    "unmasking needs consent from both participants".into(),
                ));
            }
            // One live row per requester and two participants: the pair mirrors
            assert!(
                ready.len() == 2 && ready[0].requester_id == ready[1].target_id,
                "unmasking rows for conversation {} do not mirror each other",
                conversation_id
            );

            let ids: Vec<&str> = ready.iter().map(|r| r.id.as_str()).collect();
            complete_rows(tx, &ids)?;

            let request_id = ready
                .iter()
                .find(|r| r.requester_id == caller_id)
                .map(|r| r.id.clone())
                .unwrap_or_default();
            Ok(UnmaskingOutcome {
                conversation_id: conversation_id.to_string(),
                request_id,
                status: UnmaskingStatus::Completed,
                counterpart_id: target,
                revealed: Some(reveal(tx, &conversation)?),
            })
        })?;

        info!("Unmasking completed on conversation {}", conversation_id);
        Ok(outcome)
    }

    /// Withdraw the caller's own request while nobody has acted on it.
    /// Returns the conversation id.
    pub fn cancel_unmasking_request(
        &self,
        request_id: &str,
        caller_id: &str,
    ) -> Result<String, ProtocolError> {
        self.with_tx(|tx| {
            let request = load_unmasking_request(tx, request_id)?
                .ok_or(ProtocolError::NotFound("unmasking request"))?;
            if request.requester_id != caller_id {
                return Err(ProtocolError::Forbidden("only the requester can cancel"));
            }
            if request.status != UnmaskingStatus::Pending {
                return Err(ProtocolError::InvalidState(format!(
                    "unmasking request is {}",
                    request.status.as_str()
                )));
            }
            tx.execute("DELETE FROM unmasking_requests WHERE id = ?1", [request_id])?;
            Ok(request.conversation_id)
        })
    }

    pub fn unmasking_status(
        &self,
        conversation_id: &str,
        viewer_id: &str,
    ) -> Result<UnmaskingView, ProtocolError> {
        self.with_conn(|conn| {
            // Read rows and users from one snapshot
            let tx = conn.unchecked_transaction()?;
            let conversation = load_conversation(&tx, conversation_id)?
                .filter(|c| c.has_participant(viewer_id))
                .ok_or(ProtocolError::NotFound("conversation"))?;
            let rows = load_unmasking_rows(&tx, conversation_id)?;
            let state = derive_state(&rows);

            let incoming_request_id = rows
                .iter()
                .find(|r| {
                    r.target_id == viewer_id
                        && matches!(
                            r.status,
                            UnmaskingStatus::Pending | UnmaskingStatus::MutualPending
                        )
                })
                .map(|r| r.id.clone());
            let outgoing_request_id = rows
                .iter()
                .find(|r| r.requester_id == viewer_id && r.status.is_live())
                .map(|r| r.id.clone());

            let revealed = if state == UnmaskingState::Completed {
                let other = counterpart(&conversation, viewer_id)?;
                reveal(&tx, &conversation)?
                    .into_iter()
                    .find(|user| user.user_id == other)
            } else {
                None
            };

            Ok(UnmaskingView {
                state,
                incoming_request_id,
                outgoing_request_id,
                revealed,
            })
        })
    }
}

/// Collapse a conversation's request rows into its observable state.
pub fn derive_state(rows: &[UnmaskingRequestRow]) -> UnmaskingState {
    let completed = rows
        .iter()
        .filter(|r| r.status == UnmaskingStatus::Completed)
        .count();
    if completed >= 2 {
        return UnmaskingState::Completed;
    }

    let live: Vec<&UnmaskingRequestRow> = rows.iter().filter(|r| r.status.is_live()).collect();
    match live.as_slice() {
        [] if rows.iter().any(|r| r.status == UnmaskingStatus::Declined) => UnmaskingState::Declined,
        [] => UnmaskingState::None,
        [only] => UnmaskingState::Pending {
            requester_id: only.requester_id.clone(),
        },
        many if many.iter().all(|r| r.status == UnmaskingStatus::MutualPending) => {
            UnmaskingState::MutualPending
        }
        _ => UnmaskingState::ReadyToComplete,
    }
}

/// Re-requesting after a decline is allowed only once `retry_after` has
/// passed since the latest decline; with no `retry_after`, never.
fn ensure_decline_elapsed(
    rows: &[UnmaskingRequestRow],
    retry_after: Option<chrono::Duration>,
    at: DateTime<Utc>,
) -> Result<(), ProtocolError> {
    let latest_decline = rows
        .iter()
        .filter(|r| r.status == UnmaskingStatus::Declined)
        .filter_map(|r| parse_timestamp(r.responded_at.as_deref().unwrap_or(&r.created_at)))
        .max();

    let Some(declined_at) = latest_decline else {
        return Ok(());
    };
    match retry_after {
        None => Err(ProtocolError::InvalidState(
            "unmasking was declined in this conversation".into(),
        )),
        Some(wait) if at - declined_at < wait => Err(ProtocolError::InvalidState(format!(
            "unmasking was declined; it can be requested again after {}",
            format_timestamp(declined_at + wait)
        ))),
        Some(_) => Ok(()),
    }
}

/// Load a conversation the caller takes part in and that is still active.
fn active_conversation(
    conn: &Connection,
    conversation_id: &str,
    user_id: &str,
) -> Result<ConversationRow, ProtocolError> {
    let conversation =
        load_conversation(conn, conversation_id)?.ok_or(ProtocolError::NotFound("conversation"))?;
    if !conversation.has_participant(user_id) {
        return Err(ProtocolError::Forbidden("not a participant"));
    }
    if conversation.status != ConversationStatus::Active {
        return Err(ProtocolError::InvalidState(format!(
            "conversation is {}, not active",
            conversation.status.as_str()
        )));
    }
    Ok(conversation)
}

fn counterpart(conversation: &ConversationRow, user_id: &str) -> Result<String, ProtocolError> {
    conversation
        .counterpart_of(user_id)
        .map(str::to_string)
        .ok_or(ProtocolError::Forbidden("not a participant"))
}

fn insert_request(
    conn: &Connection,
    conversation_id: &str,
    requester_id: &str,
    target_id: &str,
    status: UnmaskingStatus,
    responded_at: Option<&str>,
) -> Result<String, ProtocolError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO unmasking_requests
            (id, conversation_id, requester_id, target_id, status, created_at, responded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            id,
            conversation_id,
            requester_id,
            target_id,
            status.as_str(),
            format_timestamp(now()),
            responded_at
        ],
    )?;
    Ok(id)
}

fn set_status(conn: &Connection, request_id: &str, status: UnmaskingStatus) -> Result<(), ProtocolError> {
    conn.execute(
        "UPDATE unmasking_requests SET status = ?1 WHERE id = ?2",
        [status.as_str(), request_id],
    )?;
    Ok(())
}

fn complete_rows(conn: &Connection, ids: &[&str]) -> Result<(), ProtocolError> {
    let completed_at = format_timestamp(now());
    for id in ids {
        conn.execute(
            "UPDATE unmasking_requests SET status = 'completed', completed_at = ?1 WHERE id = ?2",
            [completed_at.as_str(), *id],
        )?;
    }
    Ok(())
}

fn reveal(conn: &Connection, conversation: &ConversationRow) -> Result<[RevealedUser; 2], ProtocolError> {
    let load = |id: &str| -> Result<RevealedUser, ProtocolError> {
        let user = query_user_by_id(conn, id)?.ok_or(ProtocolError::NotFound("user"))?;
        Ok(RevealedUser {
            user_id: user.id,
            username: user.username,
        })
    };
    Ok([load(&conversation.participant_a)?, load(&conversation.participant_b)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::Content;
    use crate::testutil::{open_db, open_db_with, user};
    use crate::ProtocolConfig;
    use std::sync::{Arc, Barrier};

    fn text(s: &str) -> Content<'_> {
        Content {
            text: s,
            image_url: None,
        }
    }

    /// alice whispers to bob, bob echoes: returns (alice, bob, conversation).
    fn active_pair(db: &Database) -> (String, String, String) {
        let alice = user(db, "alice");
        let bob = user(db, "bob");
        let whisper = db.send_whisper(&alice, "bob", &text("hello")).unwrap();
        let outcome = db.echo_whisper(&whisper.id, &bob, &text("hi")).unwrap();
        (alice, bob, outcome.conversation.id)
    }

    fn rows(db: &Database, conversation_id: &str) -> Vec<UnmaskingRequestRow> {
        db.with_conn(|conn| Ok::<_, anyhow::Error>(load_unmasking_rows(conn, conversation_id)?))
            .unwrap()
    }

    fn assert_completed_pair(db: &Database, conversation_id: &str) {
        let completed: Vec<UnmaskingRequestRow> = rows(db, conversation_id)
            .into_iter()
            .filter(|r| r.status == UnmaskingStatus::Completed)
            .collect();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].requester_id, completed[1].target_id);
        assert_eq!(completed[0].target_id, completed[1].requester_id);
        assert!(completed.iter().all(|r| r.completed_at.is_some()));
    }

    #[test]
    fn racing_requests_become_mutual_then_complete() {
        let (db, _dir) = open_db();
        let (alice, bob, conversation) = active_pair(&db);

        let first = db.request_unmasking(&conversation, &alice).unwrap();
        assert_eq!(first.status, UnmaskingStatus::Pending);
        assert_eq!(
            db.unmasking_status(&conversation, &bob).unwrap().state,
            UnmaskingState::Pending { requester_id: alice.clone() }
        );

        let second = db.request_unmasking(&conversation, &bob).unwrap();
        assert_eq!(second.status, UnmaskingStatus::MutualPending);
        assert!(rows(&db, &conversation)
            .iter()
            .all(|r| r.status == UnmaskingStatus::MutualPending));
        assert_eq!(
            db.unmasking_status(&conversation, &alice).unwrap().state,
            UnmaskingState::MutualPending
        );

        let done = db.complete_unmasking(&conversation, &bob).unwrap();
        assert_eq!(done.status, UnmaskingStatus::Completed);
        assert_eq!(done.revealed_to(&bob).unwrap().username, "alice");
        assert_completed_pair(&db, &conversation);

        let seen_by_alice = db.unmasking_status(&conversation, &alice).unwrap();
        assert_eq!(seen_by_alice.state, UnmaskingState::Completed);
        assert_eq!(seen_by_alice.revealed.unwrap().username, "bob");
        let seen_by_bob = db.unmasking_status(&conversation, &bob).unwrap();
        assert_eq!(seen_by_bob.revealed.unwrap().user_id, alice);

        let listed = db.list_conversations(&alice).unwrap();
        assert_eq!(listed[0].revealed_username.as_deref(), Some("bob"));
    }

    #[test]
    fn accept_then_complete() {
        let (db, _dir) = open_db();
        let (alice, bob, conversation) = active_pair(&db);

        let request = db.request_unmasking(&conversation, &alice).unwrap();
        let view = db.unmasking_status(&conversation, &bob).unwrap();
        assert_eq!(view.incoming_request_id.as_deref(), Some(request.request_id.as_str()));
        assert!(view.outgoing_request_id.is_none());

        let answer = db.respond_to_unmasking(&request.request_id, &bob, true).unwrap();
        assert_eq!(answer.status, UnmaskingStatus::Accepted);
        assert!(answer.revealed.is_none());
        let current = rows(&db, &conversation);
        assert_eq!(current.len(), 2);
        assert!(current.iter().all(|r| r.status == UnmaskingStatus::Accepted));
        assert_eq!(
            db.unmasking_status(&conversation, &alice).unwrap().state,
            UnmaskingState::ReadyToComplete
        );

        let done = db.complete_unmasking(&conversation, &alice).unwrap();
        assert_eq!(done.status, UnmaskingStatus::Completed);
        assert_eq!(done.revealed_to(&alice).unwrap().user_id, bob);
        assert_completed_pair(&db, &conversation);
    }

    #[test]
    fn accepting_while_own_request_is_in_flight_completes_at_once() {
        let (db, _dir) = open_db();
        let (alice, bob, conversation) = active_pair(&db);

        let from_alice = db.request_unmasking(&conversation, &alice).unwrap();
        db.request_unmasking(&conversation, &bob).unwrap();

        let answer = db.respond_to_unmasking(&from_alice.request_id, &bob, true).unwrap();
        assert_eq!(answer.status, UnmaskingStatus::Completed);
        assert_eq!(answer.revealed_to(&alice).unwrap().username, "bob");
        assert_completed_pair(&db, &conversation);

        let late = db.complete_unmasking(&conversation, &alice);
        assert!(matches!(late, Err(ProtocolError::InvalidState(_))));
    }

    #[test]
    fn decline_halts_the_handshake() {
        let (db, _dir) = open_db();
        let (alice, bob, conversation) = active_pair(&db);

        let request = db.request_unmasking(&conversation, &alice).unwrap();
        let answer = db.respond_to_unmasking(&request.request_id, &bob, false).unwrap();
        assert_eq!(answer.status, UnmaskingStatus::Declined);
        assert_eq!(
            db.unmasking_status(&conversation, &alice).unwrap().state,
            UnmaskingState::Declined
        );

        let retry = db.request_unmasking(&conversation, &alice);
        assert!(matches!(retry, Err(ProtocolError::InvalidState(_))));
        let other_side = db.request_unmasking(&conversation, &bob);
        assert!(matches!(other_side, Err(ProtocolError::InvalidState(_))));
        let answer_again = db.respond_to_unmasking(&request.request_id, &bob, true);
        assert!(matches!(answer_again, Err(ProtocolError::InvalidState(_))));
    }

    #[test]
    fn declining_a_mutual_request_declines_both_directions() {
        let (db, _dir) = open_db();
        let (alice, bob, conversation) = active_pair(&db);

        let from_alice = db.request_unmasking(&conversation, &alice).unwrap();
        db.request_unmasking(&conversation, &bob).unwrap();
        db.respond_to_unmasking(&from_alice.request_id, &bob, false).unwrap();

        assert!(rows(&db, &conversation)
            .iter()
            .all(|r| r.status == UnmaskingStatus::Declined));
        let complete = db.complete_unmasking(&conversation, &alice);
        assert!(matches!(complete, Err(ProtocolError::InvalidState(_))));
    }

    #[test]
    fn re_request_after_decline_follows_the_configured_wait() {
        let config = ProtocolConfig {
            unmask_retry_after: Some(chrono::Duration::zero()),
            ..ProtocolConfig::default()
        };
        let (db, _dir) = open_db_with(config);
        let (alice, bob, conversation) = active_pair(&db);

        let request = db.request_unmasking(&conversation, &alice).unwrap();
        db.respond_to_unmasking(&request.request_id, &bob, false).unwrap();

        let retry = db.request_unmasking(&conversation, &alice).unwrap();
        assert_eq!(retry.status, UnmaskingStatus::Pending);
        assert_eq!(
            db.unmasking_status(&conversation, &bob).unwrap().state,
            UnmaskingState::Pending { requester_id: alice }
        );
    }

    #[test]
    fn re_request_inside_the_wait_is_rejected() {
        let config = ProtocolConfig {
            unmask_retry_after: Some(chrono::Duration::hours(24)),
            ..ProtocolConfig::default()
        };
        let (db, _dir) = open_db_with(config);
        let (alice, bob, conversation) = active_pair(&db);

        let request = db.request_unmasking(&conversation, &alice).unwrap();
        db.respond_to_unmasking(&request.request_id, &bob, false).unwrap();

        let retry = db.request_unmasking(&conversation, &alice);
        assert!(matches!(retry, Err(ProtocolError::InvalidState(_))));
    }

    #[test]
    fn duplicate_requests_are_rejected() {
        let (db, _dir) = open_db();
        let (alice, _bob, conversation) = active_pair(&db);

        db.request_unmasking(&conversation, &alice).unwrap();
        let again = db.request_unmasking(&conversation, &alice);
        assert!(matches!(again, Err(ProtocolError::AlreadyExists(_))));
    }

    #[test]
    fn nothing_to_request_after_completion() {
        let (db, _dir) = open_db();
        let (alice, bob, conversation) = active_pair(&db);

        db.request_unmasking(&conversation, &alice).unwrap();
        db.request_unmasking(&conversation, &bob).unwrap();
        db.complete_unmasking(&conversation, &alice).unwrap();

        for who in [&alice, &bob] {
            let again = db.request_unmasking(&conversation, who);
            assert!(matches!(again, Err(ProtocolError::AlreadyExists(_))));
        }
    }

    #[test]
    fn only_the_target_responds() {
        let (db, _dir) = open_db();
        let (alice, bob, conversation) = active_pair(&db);

        let request = db.request_unmasking(&conversation, &alice).unwrap();
        let self_accept = db.respond_to_unmasking(&request.request_id, &alice, true);
        assert!(matches!(self_accept, Err(ProtocolError::Forbidden(_))));

        db.respond_to_unmasking(&request.request_id, &bob, true).unwrap();
        let twice = db.respond_to_unmasking(&request.request_id, &bob, true);
        assert!(matches!(twice, Err(ProtocolError::InvalidState(_))));

        let missing = db.respond_to_unmasking("no-such-request", &bob, true);
        assert!(matches!(missing, Err(ProtocolError::NotFound(_))));
    }

    #[test]
    fn completion_needs_both_sides() {
        let (db, _dir) = open_db();
        let (alice, bob, conversation) = active_pair(&db);

        let nothing = db.complete_unmasking(&conversation, &alice);
        assert!(matches!(nothing, Err(ProtocolError::InvalidState(_))));

        db.request_unmasking(&conversation, &alice).unwrap();
        let one_sided = db.complete_unmasking(&conversation, &bob);
        assert!(matches!(one_sided, Err(ProtocolError::InvalidState(_))));
        assert!(rows(&db, &conversation)
            .iter()
            .all(|r| r.status != UnmaskingStatus::Completed));
    }

    #[test]
    fn cancel_only_while_pending() {
        let (db, _dir) = open_db();
        let (alice, bob, conversation) = active_pair(&db);

        let request = db.request_unmasking(&conversation, &alice).unwrap();
        let by_other = db.cancel_unmasking_request(&request.request_id, &bob);
        assert!(matches!(by_other, Err(ProtocolError::Forbidden(_))));

        db.cancel_unmasking_request(&request.request_id, &alice).unwrap();
        assert_eq!(
            db.unmasking_status(&conversation, &bob).unwrap().state,
            UnmaskingState::None
        );

        let again = db.request_unmasking(&conversation, &alice).unwrap();
        db.request_unmasking(&conversation, &bob).unwrap();
        let too_late = db.cancel_unmasking_request(&again.request_id, &alice);
        assert!(matches!(too_late, Err(ProtocolError::InvalidState(_))));
    }

    #[test]
    fn accepted_and_completed_requests_cannot_be_cancelled() {
        let (db, _dir) = open_db();
        let (alice, bob, conversation) = active_pair(&db);

        let request = db.request_unmasking(&conversation, &alice).unwrap();
        db.respond_to_unmasking(&request.request_id, &bob, true).unwrap();
        let accepted = db.cancel_unmasking_request(&request.request_id, &alice);
        assert!(matches!(accepted, Err(ProtocolError::InvalidState(_))));
        assert!(rows(&db, &conversation)
            .iter()
            .all(|r| r.status == UnmaskingStatus::Accepted));

        db.complete_unmasking(&conversation, &alice).unwrap();
        let completed = db.cancel_unmasking_request(&request.request_id, &alice);
        assert!(matches!(completed, Err(ProtocolError::InvalidState(_))));
        assert_completed_pair(&db, &conversation);
    }

    #[test]
    fn unmasking_needs_an_active_conversation() {
        let (db, _dir) = open_db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let mallory = user(&db, "mallory");
        let whisper = db.send_whisper(&alice, "bob", &text("hello")).unwrap();
        let conversation = db.send_echo_request(&whisper.id, &bob).unwrap();

        let early = db.request_unmasking(&conversation.id, &bob);
        assert!(matches!(early, Err(ProtocolError::InvalidState(_))));

        db.accept_echo_request(&conversation.id, &alice).unwrap();
        let outsider = db.request_unmasking(&conversation.id, &mallory);
        assert!(matches!(outsider, Err(ProtocolError::Forbidden(_))));
        let hidden = db.unmasking_status(&conversation.id, &mallory);
        assert!(matches!(hidden, Err(ProtocolError::NotFound(_))));
        let missing = db.request_unmasking("no-such-conversation", &bob);
        assert!(matches!(missing, Err(ProtocolError::NotFound(_))));
    }

    #[test]
    fn concurrent_requests_from_separate_handles_always_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hush.db");
        let first = Arc::new(Database::open(&path, ProtocolConfig::default()).unwrap());
        let second = Arc::new(Database::open(&path, ProtocolConfig::default()).unwrap());

        let alice = user(&first, "alice");
        let bob = user(&first, "bob");

        for round in 0..10 {
            let whisper = first
                .send_whisper(&alice, "bob", &text(&format!("round {}", round)))
                .unwrap();
            let conversation = first
                .echo_whisper(&whisper.id, &bob, &text("hi"))
                .unwrap()
                .conversation
                .id;

            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = [(first.clone(), alice.clone()), (second.clone(), bob.clone())]
                .into_iter()
                .map(|(db, requester)| {
                    let barrier = barrier.clone();
                    let conversation = conversation.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        db.request_unmasking(&conversation, &requester).unwrap().status
                    })
                })
                .collect();

            let mut statuses: Vec<UnmaskingStatus> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            statuses.sort_by_key(|s| s.as_str());
            assert_eq!(
                statuses,
                [UnmaskingStatus::MutualPending, UnmaskingStatus::Pending],
                "round {}",
                round
            );
            assert_eq!(
                first.unmasking_status(&conversation, &alice).unwrap().state,
                UnmaskingState::MutualPending
            );
        }
    }

    #[test]
    fn derived_state_covers_every_row_shape() {
        let row = |requester: &str, status: UnmaskingStatus| UnmaskingRequestRow {
            id: Uuid::new_v4().to_string(),
            conversation_id: "c".into(),
            requester_id: requester.into(),
            target_id: if requester == "a" { "b".into() } else { "a".into() },
            status,
            created_at: format_timestamp(now()),
            responded_at: None,
            completed_at: None,
        };
        use UnmaskingStatus::*;

        assert_eq!(derive_state(&[]), UnmaskingState::None);
        assert_eq!(
            derive_state(&[row("a", Pending)]),
            UnmaskingState::Pending { requester_id: "a".into() }
        );
        assert_eq!(
            derive_state(&[row("a", MutualPending), row("b", MutualPending)]),
            UnmaskingState::MutualPending
        );
        assert_eq!(
            derive_state(&[row("a", Accepted), row("b", Accepted)]),
            UnmaskingState::ReadyToComplete
        );
        assert_eq!(
            derive_state(&[row("a", Accepted), row("b", MutualPending)]),
            UnmaskingState::ReadyToComplete
        );
        assert_eq!(
            derive_state(&[row("a", Completed), row("b", Completed)]),
            UnmaskingState::Completed
        );
        assert_eq!(derive_state(&[row("a", Declined)]), UnmaskingState::Declined);
        assert_eq!(
            derive_state(&[row("a", Declined), row("b", Pending)]),
            UnmaskingState::Pending { requester_id: "b".into() }
        );
    }
}
