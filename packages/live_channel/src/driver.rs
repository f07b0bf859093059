//! Per-session sequencing policy.
//!
//! [`SessionDriver`] is a sans-IO state machine. The caller owns the socket
//! and the timers, feeds the driver what happened (socket opened, text
//! received, pacing delay elapsed, session deadline elapsed, socket closed)
//! and executes the [`Action`]s it returns. Phases only move forward:
//!
//! ```text
//! Connecting -> Joining -> Joined -> Exchanging -> Closing -> Closed
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::bootstrap::{Bootstrap, JoinCredentials, Topic};
use crate::error::ChannelError;
use crate::message::{self, Frame, PHX_REPLY, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionPhase {
    Connecting,
    Joining,
    Joined,
    Exchanging,
    Closing,
    Closed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Exchanging => "exchanging",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a session sends after it has joined. Shared read-only across
/// sessions.
#[derive(Debug, Clone)]
pub struct ExchangePlan {
    /// Application event name, e.g. `run_code`.
    pub event_name: String,
    /// Form field carrying the content, e.g. `code`.
    pub field: String,
    /// Contents cycled through by successive event messages.
    pub samples: Arc<[String]>,
    /// Event messages to send before closing.
    pub max_messages: usize,
    /// Delay between a reply and the next event message.
    pub pace: Duration,
}

impl ExchangePlan {
    /// Content of the `n`th event message (1-based).
    fn sample(&self, n: usize) -> &str {
        if self.samples.is_empty() {
            return "";
        }
        &self.samples[(n - 1) % self.samples.len()]
    }
}

/// Something the caller must do on the driver's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write the frame to the socket.
    Send(Frame),
    /// Wait, then call [`SessionDriver::pace_elapsed`].
    Pause(Duration),
    /// Record the outcome of a reply.
    Check(ReplyCheck),
    /// Close the socket.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Join,
    Event,
}

/// A reply to one of our refs, ok or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyCheck {
    pub kind: ReplyKind,
    pub seq: u64,
    pub status: Option<String>,
}

impl ReplyCheck {
    pub fn passed(&self) -> bool {
        self.status.as_deref() == Some(message::STATUS_OK)
    }

    pub fn result(&self) -> Result<(), ChannelError> {
        if self.passed() {
            Ok(())
        } else {
            Err(ChannelError::ReplyStatusMismatch {
                status: self.status.clone(),
            })
        }
    }
}

#[derive(Debug)]
pub struct SessionDriver {
    phase: SessionPhase,
    topic: Topic,
    endpoint_url: String,
    credentials: JoinCredentials,
    plan: ExchangePlan,
    join_seq: u64,
    /// `None` once the ref space is used up.
    next_seq: Option<u64>,
    outstanding: Option<u64>,
    sent_events: usize,
}

impl SessionDriver {
    pub fn new(bootstrap: &Bootstrap, endpoint_url: impl Into<String>, plan: ExchangePlan) -> Self {
        Self {
            phase: SessionPhase::Connecting,
            topic: bootstrap.topic(),
            endpoint_url: endpoint_url.into(),
            credentials: bootstrap.credentials.clone(),
            plan,
            join_seq: 0,
            next_seq: Some(1),
            outstanding: None,
            sent_events: 0,
        }
    }

    /// Start numbering at `seq` instead of 0. Events take the refs after
    /// it; a session that runs out of refs closes as if its message budget
    /// were spent.
    pub fn with_start_seq(mut self, seq: u64) -> Self {
        self.join_seq = seq;
        self.next_seq = seq.checked_add(1);
        self
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn sent_events(&self) -> usize {
        self.sent_events
    }

    fn can_send(&self) -> bool {
        self.next_seq.is_some() && self.sent_events < self.plan.max_messages
    }

    fn advance(&mut self, next: SessionPhase) {
        debug_assert!(next >= self.phase, "{} -> {next}", self.phase);
        if next != self.phase {
            debug!(topic = %self.topic, from = %self.phase, to = %next, "session phase");
            self.phase = next;
        }
    }

    /// The transport is up: send the join.
    pub fn opened(&mut self) -> Vec<Action> {
        if self.phase != SessionPhase::Connecting {
            return Vec::new();
        }
        let join = message::join_frame(
            &self.topic,
            &self.endpoint_url,
            &self.credentials,
            self.join_seq,
        );
        self.outstanding = Some(self.join_seq);
        self.advance(SessionPhase::Joining);
        vec![Action::Send(join)]
    }

    /// Inbound socket text. A decode failure closes the session.
    pub fn received(&mut self, text: &str) -> Result<Vec<Action>, ChannelError> {
        match message::decode(text) {
            Ok(frame) => Ok(self.handle_frame(&frame)),
            Err(err) => {
                self.advance(SessionPhase::Closed);
                Err(err)
            }
        }
    }

    pub fn handle_frame(&mut self, frame: &Frame) -> Vec<Action> {
        let awaited = frame.event == PHX_REPLY
            && frame.topic == self.topic.as_str()
            && self.outstanding.is_some()
            && frame.seq() == self.outstanding;
        if !awaited {
            trace!(topic = %frame.topic, event = %frame.event, "passing frame through");
            return Vec::new();
        }

        let reply = Reply::from_payload(&frame.payload);
        let seq = self.outstanding.take().unwrap_or_default();

        match self.phase {
            SessionPhase::Joining => {
                let check = ReplyCheck {
                    kind: ReplyKind::Join,
                    seq,
                    status: reply.status,
                };
                if !check.passed() {
                    self.advance(SessionPhase::Closing);
                    return vec![Action::Check(check), Action::Close];
                }
                self.advance(SessionPhase::Joined);
                if !self.can_send() {
                    self.advance(SessionPhase::Closing);
                    return vec![Action::Check(check), Action::Close];
                }
                vec![Action::Check(check), Action::Pause(self.plan.pace)]
            }
            SessionPhase::Exchanging => {
                let check = ReplyCheck {
                    kind: ReplyKind::Event,
                    seq,
                    status: reply.status,
                };
                if !self.can_send() {
                    self.advance(SessionPhase::Closing);
                    vec![Action::Check(check), Action::Close]
                } else {
                    vec![Action::Check(check), Action::Pause(self.plan.pace)]
                }
            }
            _ => Vec::new(),
        }
    }

    /// The pacing delay requested by [`Action::Pause`] has passed.
    pub fn pace_elapsed(&mut self) -> Vec<Action> {
        let ready = matches!(
            self.phase,
            SessionPhase::Joined | SessionPhase::Exchanging
        ) && self.outstanding.is_none();
        let Some(seq) = self.next_seq.filter(|_| ready && self.can_send()) else {
            return Vec::new();
        };

        self.next_seq = seq.checked_add(1);
        self.sent_events += 1;
        self.outstanding = Some(seq);
        let frame = message::form_event_frame(
            &self.topic,
            seq,
            &self.plan.event_name,
            &self.plan.field,
            self.plan.sample(self.sent_events),
        );
        self.advance(SessionPhase::Exchanging);
        vec![Action::Send(frame)]
    }

    /// The session's wall-clock budget is spent. A reply still owed to us
    /// is recorded as failed before closing.
    pub fn deadline_elapsed(&mut self) -> Vec<Action> {
        if self.phase >= SessionPhase::Closing {
            return Vec::new();
        }
        let kind = match self.phase {
            SessionPhase::Joining => ReplyKind::Join,
            _ => ReplyKind::Event,
        };
        let mut actions = Vec::new();
        if let Some(seq) = self.outstanding.take() {
            actions.push(Action::Check(ReplyCheck {
                kind,
                seq,
                status: None,
            }));
        }
        self.advance(SessionPhase::Closing);
        actions.push(Action::Close);
        actions
    }

    /// The socket is gone. Reported as an error unless we were closing.
    pub fn transport_closed(&mut self) -> Result<(), ChannelError> {
        let phase = self.phase;
        self.advance(SessionPhase::Closed);
        if phase < SessionPhase::Closing {
            Err(ChannelError::Transport { phase })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn bootstrap() -> Bootstrap {
        Bootstrap {
            credentials: JoinCredentials {
                csrf_token: "abc".into(),
                session_token: "sess1".into(),
                static_token: "stat1".into(),
            },
            element_id: "phx-1".into(),
        }
    }

    fn plan(max_messages: usize) -> ExchangePlan {
        ExchangePlan {
            event_name: "run_code".into(),
            field: "code".into(),
            samples: vec!["(+ 1 2)".to_string(), "(car '(a b))".to_string()].into(),
            max_messages,
            pace: Duration::from_millis(250),
        }
    }

    fn driver(max_messages: usize) -> SessionDriver {
        SessionDriver::new(&bootstrap(), "http://localhost:4000", plan(max_messages))
    }

    fn reply(seq: u64, status: &str) -> String {
        format!(r#"["null","{seq}","lv:phx-1","phx_reply",{{"status":"{status}","response":{{}}}}]"#)
    }

    fn sent(actions: &[Action]) -> Vec<&Frame> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn open_sends_join_with_seq_zero() {
        let mut d = driver(1);
        let actions = d.opened();
        assert_eq!(d.phase(), SessionPhase::Joining);
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].encode(),
            r#"["null","0","lv:phx-1","phx_join",{"url":"http://localhost:4000","params":{"_csrf_token":"abc","_mounts":0},"session":"sess1","static":"stat1"}]"#
        );
    }

    #[test]
    fn open_is_only_honoured_once() {
        let mut d = driver(1);
        d.opened();
        assert!(d.opened().is_empty());
    }

    #[test]
    fn join_ok_then_one_event_then_close() {
        let mut d = driver(1);
        d.opened();

        let actions = d.received(&reply(0, "ok")).unwrap();
        assert_eq!(d.phase(), SessionPhase::Joined);
        assert_eq!(
            actions,
            vec![
                Action::Check(ReplyCheck {
                    kind: ReplyKind::Join,
                    seq: 0,
                    status: Some("ok".into())
                }),
                Action::Pause(Duration::from_millis(250)),
            ]
        );

        let actions = d.pace_elapsed();
        assert_eq!(d.phase(), SessionPhase::Exchanging);
        let frames = sent(&actions);
        assert_eq!(
            frames[0].encode(),
            r#"["null","1","lv:phx-1","event",{"type":"form","event":"run_code","value":"code=%28%2B%201%202%29"}]"#
        );

        let actions = d.received(&reply(1, "ok")).unwrap();
        assert_eq!(d.phase(), SessionPhase::Closing);
        assert_eq!(actions.last(), Some(&Action::Close));

        d.transport_closed().unwrap();
        assert_eq!(d.phase(), SessionPhase::Closed);
    }

    #[test]
    fn event_seqs_are_contiguous() {
        let mut d = driver(5);
        d.opened();
        d.received(&reply(0, "ok")).unwrap();

        let mut seqs = Vec::new();
        loop {
            let actions = d.pace_elapsed();
            let Some(frame) = sent(&actions).first().cloned().cloned() else {
                break;
            };
            let seq = frame.seq().unwrap();
            seqs.push(seq);
            d.received(&reply(seq, "ok")).unwrap();
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(d.sent_events(), 5);
        assert_eq!(d.phase(), SessionPhase::Closing);
    }

    #[test]
    fn samples_cycle() {
        let mut d = driver(3);
        d.opened();
        d.received(&reply(0, "ok")).unwrap();
        let mut contents = Vec::new();
        for seq in 1..=3 {
            let actions = d.pace_elapsed();
            let frame = sent(&actions)[0].clone();
            let Message::Form(form) = frame.message() else {
                panic!("expected form event");
            };
            contents.push(form.value);
            d.received(&reply(seq, "ok")).unwrap();
        }
        assert_eq!(
            contents,
            vec![
                "code=%28%2B%201%202%29",
                "code=%28car%20%27%28a%20b%29%29",
                "code=%28%2B%201%202%29"
            ]
        );
    }

    #[test]
    fn no_event_until_reply_observed() {
        let mut d = driver(3);
        d.opened();
        d.received(&reply(0, "ok")).unwrap();
        assert_eq!(sent(&d.pace_elapsed()).len(), 1);
        // Reply to seq 1 still outstanding.
        assert!(d.pace_elapsed().is_empty());
    }

    #[test]
    fn pace_before_join_is_ignored() {
        let mut d = driver(3);
        assert!(d.pace_elapsed().is_empty());
        d.opened();
        assert!(d.pace_elapsed().is_empty());
        assert_eq!(d.phase(), SessionPhase::Joining);
    }

    #[test]
    fn rejected_join_closes() {
        let mut d = driver(3);
        d.opened();
        let actions = d.received(&reply(0, "error")).unwrap();
        assert_eq!(d.phase(), SessionPhase::Closing);
        let Action::Check(check) = &actions[0] else {
            panic!("expected check");
        };
        assert!(!check.passed());
        assert_eq!(
            check.result(),
            Err(ChannelError::ReplyStatusMismatch {
                status: Some("error".into())
            })
        );
        assert_eq!(actions[1], Action::Close);
        assert!(d.pace_elapsed().is_empty());
    }

    #[test]
    fn failed_event_reply_is_recorded_and_exchange_continues() {
        let mut d = driver(2);
        d.opened();
        d.received(&reply(0, "ok")).unwrap();
        d.pace_elapsed();
        let actions = d.received(&reply(1, "error")).unwrap();
        let Action::Check(check) = &actions[0] else {
            panic!("expected check");
        };
        assert_eq!(check.kind, ReplyKind::Event);
        assert!(!check.passed());
        assert!(matches!(actions[1], Action::Pause(_)));
        assert_eq!(d.phase(), SessionPhase::Exchanging);
        assert_eq!(sent(&d.pace_elapsed())[0].seq(), Some(2));
    }

    #[test]
    fn zero_budget_closes_after_join() {
        let mut d = driver(0);
        d.opened();
        let actions = d.received(&reply(0, "ok")).unwrap();
        assert_eq!(actions.last(), Some(&Action::Close));
        assert_eq!(d.phase(), SessionPhase::Closing);
    }

    #[test]
    fn unrelated_frames_pass_through() {
        let mut d = driver(1);
        d.opened();
        // Wrong ref, wrong topic, server push.
        assert!(d.received(&reply(9, "ok")).unwrap().is_empty());
        assert!(
            d.received(r#"["null","0","lv:other","phx_reply",{"status":"ok"}]"#)
                .unwrap()
                .is_empty()
        );
        assert!(d.received(r#"[null,null,"lv:phx-1","diff",{"0":"x"}]"#).unwrap().is_empty());
        assert_eq!(d.phase(), SessionPhase::Joining);
    }

    #[test]
    fn malformed_text_closes_session() {
        let mut d = driver(1);
        d.opened();
        let err = d.received("not json").unwrap_err();
        assert!(matches!(err, ChannelError::MalformedMessage { .. }));
        assert_eq!(d.phase(), SessionPhase::Closed);
    }

    #[test]
    fn deadline_forces_close() {
        let mut d = driver(10);
        d.opened();
        d.received(&reply(0, "ok")).unwrap();
        d.pace_elapsed();
        assert_eq!(
            d.deadline_elapsed(),
            vec![
                Action::Check(ReplyCheck {
                    kind: ReplyKind::Event,
                    seq: 1,
                    status: None
                }),
                Action::Close
            ]
        );
        assert_eq!(d.phase(), SessionPhase::Closing);
        assert!(d.deadline_elapsed().is_empty());
        // A late reply does not reopen the exchange.
        assert!(d.received(&reply(1, "ok")).unwrap().is_empty());
        assert!(d.transport_closed().is_ok());
    }

    #[test]
    fn early_transport_close_is_an_error() {
        let mut d = driver(1);
        d.opened();
        assert_eq!(
            d.transport_closed(),
            Err(ChannelError::Transport {
                phase: SessionPhase::Joining
            })
        );
        assert_eq!(d.phase(), SessionPhase::Closed);
    }

    #[test]
    fn custom_start_seq() {
        let mut d = driver(1).with_start_seq(10);
        let join = sent(&d.opened())[0].clone();
        assert_eq!(join.seq(), Some(10));
        d.received(&reply(10, "ok")).unwrap();
        assert_eq!(sent(&d.pace_elapsed())[0].seq(), Some(11));
    }

    #[test]
    fn deadline_fails_an_unanswered_join() {
        let mut d = driver(1);
        d.opened();
        let actions = d.deadline_elapsed();
        let Action::Check(check) = &actions[0] else {
            panic!("expected check");
        };
        assert_eq!(check.kind, ReplyKind::Join);
        assert_eq!(check.seq, 0);
        assert_eq!(
            check.result(),
            Err(ChannelError::ReplyStatusMismatch { status: None })
        );
        assert_eq!(actions[1], Action::Close);
    }

    #[test]
    fn deadline_between_events_has_nothing_to_fail() {
        let mut d = driver(3);
        d.opened();
        d.received(&reply(0, "ok")).unwrap();
        d.pace_elapsed();
        d.received(&reply(1, "ok")).unwrap();
        assert_eq!(d.deadline_elapsed(), vec![Action::Close]);
    }

    #[test]
    fn start_seq_at_the_top_of_the_ref_space() {
        let mut d = driver(3).with_start_seq(u64::MAX);
        assert_eq!(sent(&d.opened())[0].seq(), Some(u64::MAX));
        let actions = d.received(&reply(u64::MAX, "ok")).unwrap();
        assert_eq!(actions.last(), Some(&Action::Close));
        assert_eq!(d.sent_events(), 0);

        let mut d = driver(3).with_start_seq(u64::MAX - 1);
        d.opened();
        d.received(&reply(u64::MAX - 1, "ok")).unwrap();
        assert_eq!(sent(&d.pace_elapsed())[0].seq(), Some(u64::MAX));
        let actions = d.received(&reply(u64::MAX, "ok")).unwrap();
        assert_eq!(actions.last(), Some(&Action::Close));
        assert!(d.pace_elapsed().is_empty());
        assert_eq!(d.sent_events(), 1);
    }
}
