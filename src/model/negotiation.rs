//! Signaling phases of one call attempt and the transitions between them.
//!
//! ```text
//! Idle ──StartCall──▶ Connecting ──LocalOffer──▶ HaveLocalOffer ──RemoteAnswer──▶ Stable
//!  │                                                                              ▲  │
//!  └──RemoteOffer──▶ HaveRemoteOffer ─────────────LocalAnswer─────────────────────┘  │
//!                                                                                    │
//! Stable ──IceRestart──▶ HaveLocalOffer          Stable ──RemoteOffer──▶ HaveRemoteOffer
//! HaveLocalOffer ──Rollback──▶ Stable
//! any ──End──▶ Closed
//! ```

use crate::error::ProtocolStateError;

/// Where a call attempt currently is in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationPhase {
    /// No negotiation has started.
    Idle,
    /// Local media is being acquired and the offer has not been applied yet.
    Connecting,
    /// Our offer is applied locally and sent, waiting for the answer.
    HaveLocalOffer,
    /// A remote offer is applied, our answer is not yet.
    HaveRemoteOffer,
    /// Both descriptions are applied.
    Stable,
    /// Peer connection closed and media released.
    Closed,
}

/// Inputs to [`NegotiationPhase::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseEvent {
    StartCall,
    LocalOffer,
    RemoteAnswer,
    RemoteOffer,
    LocalAnswer,
    IceRestart,
    /// A pending ICE-restart offer is withdrawn.
    Rollback,
    End,
}

impl NegotiationPhase {
    /// Applies `event`, returning the next phase or the rejected pair.
    ///
    /// `RemoteOffer` in `Stable` is only accepted for ICE restarts on the existing
    /// connection; fresh offers in `Stable` are handled by tearing the call down and
    /// starting a new attempt from `Idle`.
    pub fn on(self, event: PhaseEvent) -> Result<NegotiationPhase, ProtocolStateError> {
        use NegotiationPhase::*;
        use PhaseEvent::*;

        let next = match (self, event) {
            (_, End) => Closed,
            (Idle, StartCall) => Connecting,
            (Connecting, LocalOffer) => HaveLocalOffer,
            (HaveLocalOffer, RemoteAnswer) => Stable,
            (Idle, RemoteOffer) | (Stable, RemoteOffer) => HaveRemoteOffer,
            (HaveRemoteOffer, LocalAnswer) => Stable,
            (Stable, IceRestart) => HaveLocalOffer,
            (HaveLocalOffer, Rollback) => Stable,
            (phase, event) => return Err(ProtocolStateError { phase, event }),
        };

        Ok(next)
    }

    /// True once the call has ended.
    pub fn is_closed(self) -> bool {
        self == NegotiationPhase::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::NegotiationPhase::*;
    use super::PhaseEvent::*;
    use super::*;

    #[test]
    fn outbound_call_reaches_stable() {
        let phase = Idle.on(StartCall).and_then(|p| p.on(LocalOffer));
        assert_eq!(phase, Ok(HaveLocalOffer));
        assert_eq!(HaveLocalOffer.on(RemoteAnswer), Ok(Stable));
    }

    #[test]
    fn inbound_call_reaches_stable() {
        assert_eq!(Idle.on(RemoteOffer), Ok(HaveRemoteOffer));
        assert_eq!(HaveRemoteOffer.on(LocalAnswer), Ok(Stable));
    }

    #[test]
    fn answer_outside_have_local_offer_is_rejected() {
        for phase in [Idle, Connecting, HaveRemoteOffer, Stable, Closed] {
            let err = phase.on(RemoteAnswer).unwrap_err();
            assert_eq!(err.phase, phase);
            assert_eq!(err.event, RemoteAnswer);
        }
    }

    #[test]
    fn offer_during_own_offer_is_rejected() {
        assert!(HaveLocalOffer.on(RemoteOffer).is_err());
        assert!(Connecting.on(RemoteOffer).is_err());
    }

    #[test]
    fn ice_restart_only_from_stable() {
        assert_eq!(Stable.on(IceRestart), Ok(HaveLocalOffer));
        assert!(HaveLocalOffer.on(IceRestart).is_err());
        assert!(Idle.on(IceRestart).is_err());
    }

    #[test]
    fn rollback_returns_to_stable() {
        let restarted = Stable.on(IceRestart).and_then(|p| p.on(Rollback));
        assert_eq!(restarted, Ok(Stable));
        assert!(Stable.on(Rollback).is_err());
        assert!(HaveRemoteOffer.on(Rollback).is_err());
    }

    #[test]
    fn end_is_accepted_everywhere() {
        for phase in [Idle, Connecting, HaveLocalOffer, HaveRemoteOffer, Stable, Closed] {
            assert_eq!(phase.on(End), Ok(Closed));
        }
    }

    #[test]
    fn closed_accepts_nothing_but_end() {
        for event in [StartCall, LocalOffer, RemoteOffer, LocalAnswer, IceRestart, Rollback] {
            assert!(Closed.on(event).is_err());
        }
    }
}
