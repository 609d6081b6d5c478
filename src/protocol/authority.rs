//! Which side of the session may send which message.
//!
//! Checked before any handler runs. A wrong-direction message is normally a
//! harmless race (roles not yet synchronized) and is ignored; a non-host
//! issuing an administrative message is masquerading authority and is kicked.

use crate::protocol::message::{ControlKind, DeltaKind};

/// Role a sender must have for a message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderRole {
    Host,
    Client,
    Any,
}

/// What happens when the sender has the wrong role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationAction {
    Ignore,
    Kick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthorityRule {
    pub sender: SenderRole,
    pub on_violation: ViolationAction,
}

impl AuthorityRule {
    const fn host_only() -> Self {
        Self {
            sender: SenderRole::Host,
            on_violation: ViolationAction::Ignore,
        }
    }

    const fn host_only_strict() -> Self {
        Self {
            sender: SenderRole::Host,
            on_violation: ViolationAction::Kick,
        }
    }

    const fn client_only() -> Self {
        Self {
            sender: SenderRole::Client,
            on_violation: ViolationAction::Ignore,
        }
    }

    const fn anyone() -> Self {
        Self {
            sender: SenderRole::Any,
            on_violation: ViolationAction::Ignore,
        }
    }
}

/// Message kinds that carry a direction rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    HeartbeatPing,
    HeartbeatPong,
    Delta(DeltaKind),
    ClientTick,
    CullState,
    Control(ControlKind),
}

impl MessageKind {
    pub fn rule(self) -> AuthorityRule {
        match self {
            MessageKind::HeartbeatPing | MessageKind::CullState => AuthorityRule::host_only(),
            MessageKind::HeartbeatPong | MessageKind::ClientTick => AuthorityRule::client_only(),
            MessageKind::Delta(_) => AuthorityRule::anyone(),
            MessageKind::Control(kind) => match kind {
                ControlKind::ServerInfo
                | ControlKind::Welcome
                | ControlKind::MountedVpksResponse
                | ControlKind::InitialSnapshotResponse
                | ControlKind::Activate => AuthorityRule::host_only(),
                ControlKind::Kick => AuthorityRule::host_only_strict(),
                ControlKind::UserInfo
                | ControlKind::RequestMountedVpks
                | ControlKind::RequestInitialSnapshot
                | ControlKind::ClientReady => AuthorityRule::client_only(),
                ControlKind::RestartHandshake
                | ControlKind::TargetedMessage
                | ControlKind::TargetedInternalMessage => AuthorityRule::anyone(),
            },
        }
    }
}

/// Outcome of an authority check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Ignore,
    Kick(String),
}

/// Check `kind` arriving from a sender with the given host flag.
///
/// Client-only messages are additionally only meaningful when the local
/// peer is the host.
pub fn check(kind: MessageKind, local_is_host: bool, sender_is_host: bool) -> Verdict {
    let rule = kind.rule();
    let allowed = match rule.sender {
        SenderRole::Any => true,
        SenderRole::Host => sender_is_host,
        SenderRole::Client => !sender_is_host && local_is_host,
    };
    if allowed {
        return Verdict::Allowed;
    }
    match rule.on_violation {
        ViolationAction::Ignore => Verdict::Ignore,
        ViolationAction::Kick => Verdict::Kick(format!(
            "{kind:?} may only be sent by the host"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_only_from_client_is_ignored() {
        let kind = MessageKind::Control(ControlKind::Welcome);
        assert_eq!(check(kind, false, true), Verdict::Allowed);
        assert_eq!(check(kind, false, false), Verdict::Ignore);
        assert_eq!(check(MessageKind::HeartbeatPing, true, false), Verdict::Ignore);
    }

    #[test]
    fn test_client_only_from_host_is_ignored() {
        let kind = MessageKind::Control(ControlKind::UserInfo);
        assert_eq!(check(kind, true, false), Verdict::Allowed);
        assert_eq!(check(kind, false, true), Verdict::Ignore);
        // a client receiving a client-only message from another client
        assert_eq!(check(kind, false, false), Verdict::Ignore);
    }

    #[test]
    fn test_kick_from_client_is_escalation() {
        let verdict = check(MessageKind::Control(ControlKind::Kick), true, false);
        assert!(matches!(verdict, Verdict::Kick(_)));
        assert_eq!(
            check(MessageKind::Control(ControlKind::Kick), false, true),
            Verdict::Allowed
        );
    }

    #[test]
    fn test_unrestricted_kinds() {
        for kind in [
            MessageKind::Delta(DeltaKind::Snapshot),
            MessageKind::Control(ControlKind::RestartHandshake),
            MessageKind::Control(ControlKind::TargetedMessage),
        ] {
            assert_eq!(check(kind, false, false), Verdict::Allowed);
            assert_eq!(check(kind, true, false), Verdict::Allowed);
        }
    }
}
