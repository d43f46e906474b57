//! Presentation context negotiation.
//!
//! Given the acceptor's statically configured catalogue of
//! supported abstract syntaxes, transfer syntax preferences and roles,
//! and the requestor's proposed presentation context list,
//! this module produces one accept/reject decision per proposed context.
//! The procedure is deterministic:
//! the same catalogue and the same proposal
//! always yield the same decision set.
use std::borrow::Cow;
use std::collections::HashMap;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

use crate::pdu::{
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    RoleSelection, UserVariableItem,
};

use super::uid::trim_uid;

/// The outcome of negotiating a single presentation context
/// on the acceptor side,
/// retaining the abstract syntax it was proposed with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresentationContextNegotiated {
    /// the presentation context identifier,
    /// exactly as proposed by the requestor
    pub id: u8,
    /// whether the context was accepted, and if not, why
    pub reason: PresentationContextResultReason,
    /// the chosen transfer syntax,
    /// only significant on acceptance
    pub transfer_syntax: String,
    /// the abstract syntax the context was proposed with
    pub abstract_syntax: String,
}

impl PresentationContextNegotiated {
    /// Whether this context was accepted.
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }
}

impl From<&PresentationContextNegotiated> for PresentationContextResult {
    fn from(pc: &PresentationContextNegotiated) -> Self {
        PresentationContextResult {
            id: pc.id,
            reason: pc.reason,
            transfer_syntax: pc.transfer_syntax.clone(),
        }
    }
}

/// Negotiate every proposed presentation context independently
/// against the acceptor's catalogue.
///
/// `abstract_syntax_uids` is the set of abstract syntaxes the acceptor
/// recognizes (ignored when `promiscuous` is in effect).
/// `transfer_syntax_uids` is the acceptor's transfer syntax preference list:
/// the first entry of that list which also appears among the proposed
/// candidates (and is supported by the transfer syntax registry) is chosen.
/// An empty preference list admits any registry-supported transfer syntax,
/// scanning the proposal in the order given by the requestor.
///
/// Context IDs are never renumbered;
/// a rejection of one context does not affect the others.
pub fn negotiate_presentation_contexts<'a>(
    proposed: impl IntoIterator<Item = &'a PresentationContextProposed>,
    abstract_syntax_uids: &[Cow<'_, str>],
    transfer_syntax_uids: &[Cow<'_, str>],
    promiscuous: bool,
) -> Vec<PresentationContextNegotiated> {
    proposed
        .into_iter()
        .map(|pc| {
            let abstract_syntax = trim_uid(Cow::from(pc.abstract_syntax.as_str()));
            if !abstract_syntax_uids.contains(&abstract_syntax) && !promiscuous {
                return PresentationContextNegotiated {
                    id: pc.id,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: "1.2.840.10008.1.2".to_string(),
                    abstract_syntax: abstract_syntax.to_string(),
                };
            }

            let (transfer_syntax, reason) = choose_transfer_syntax(
                &pc.transfer_syntaxes,
                transfer_syntax_uids,
            )
            .map(|ts| (ts, PresentationContextResultReason::Acceptance))
            .unwrap_or_else(|| {
                (
                    "1.2.840.10008.1.2".to_string(),
                    PresentationContextResultReason::TransferSyntaxesNotSupported,
                )
            });

            PresentationContextNegotiated {
                id: pc.id,
                reason,
                transfer_syntax,
                abstract_syntax: abstract_syntax.to_string(),
            }
        })
        .collect()
}

/// Choose the transfer syntax for one presentation context.
///
/// With a non-empty preference list,
/// the acceptor's order wins:
/// the first preferred syntax found among the proposed candidates
/// is chosen.
/// With an empty preference list,
/// the first registry-supported candidate is chosen
/// in the order of the proposal.
fn choose_transfer_syntax(
    proposed: &[String],
    preference: &[Cow<'_, str>],
) -> Option<String> {
    if preference.is_empty() {
        return choose_supported(proposed.iter()).cloned();
    }

    preference
        .iter()
        .find(|preferred| {
            is_supported(preferred)
                && proposed
                    .iter()
                    .any(|candidate| trim_uid(Cow::from(candidate.as_str())).as_ref() == preferred.as_ref())
        })
        .map(|ts| ts.to_string())
}

/// Answer the proposed SCP/SCU role selections.
///
/// `supported_roles` maps a SOP class UID to the pair
/// `(scu_role, scp_role)` which the acceptor is able to accept
/// from the requestor.
/// A proposal for an unconfigured SOP class is left unanswered,
/// falling back to the default role handling of the protocol.
pub fn negotiate_roles(
    proposed: &[UserVariableItem],
    supported_roles: &HashMap<String, (bool, bool)>,
) -> Vec<UserVariableItem> {
    proposed
        .iter()
        .filter_map(|item| match item {
            UserVariableItem::RoleSelection(role) => {
                supported_roles.get(&role.sop_class_uid).map(|(scu, scp)| {
                    UserVariableItem::RoleSelection(RoleSelection {
                        sop_class_uid: role.sop_class_uid.clone(),
                        scu_role: role.scu_role && *scu,
                        scp_role: role.scp_role && *scp,
                    })
                })
            }
            _ => None,
        })
        .collect()
}

/// Check that a transfer syntax repository
/// supports the given transfer syntax,
/// meaning that it can parse and decode data sets under it.
///
/// ```
/// # use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
/// # use dicom_net::association::negotiate::is_supported_with_repo;
/// // Implicit VR Little Endian is guaranteed to be supported
/// assert!(is_supported_with_repo(TransferSyntaxRegistry, "1.2.840.10008.1.2"));
/// ```
pub fn is_supported_with_repo<R>(ts_repo: R, ts_uid: &str) -> bool
where
    R: TransferSyntaxIndex,
{
    ts_repo
        .get(ts_uid)
        .filter(|ts| !ts.is_unsupported())
        .is_some()
}

/// Check that the main transfer syntax registry
/// supports the given transfer syntax.
///
/// ```
/// # use dicom_net::association::negotiate::is_supported;
/// assert!(is_supported("1.2.840.10008.1.2"));
/// ```
pub fn is_supported(ts_uid: &str) -> bool {
    is_supported_with_repo(TransferSyntaxRegistry, ts_uid)
}

/// From a sequence of transfer syntaxes,
/// choose the first to be supported by the main registry.
pub fn choose_supported<I, T>(it: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter().find(|ts| is_supported(ts.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const MR_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
    const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    fn catalogue() -> Vec<Cow<'static, str>> {
        vec![Cow::from(VERIFICATION)]
    }

    fn proposed(id: u8, abstract_syntax: &str, ts: &[&str]) -> PresentationContextProposed {
        PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: ts.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn accepts_known_abstract_syntax_with_common_transfer_syntax() {
        let out = negotiate_presentation_contexts(
            &[proposed(1, VERIFICATION, &[IMPLICIT_VR_LE, EXPLICIT_VR_LE])],
            &catalogue(),
            &[],
            false,
        );
        assert_eq!(out.len(), 1);
        assert!(out[0].is_accepted());
        assert_eq!(out[0].id, 1);
        assert_eq!(out[0].transfer_syntax, IMPLICIT_VR_LE);
    }

    #[test]
    fn acceptor_preference_order_wins() {
        // the proposal leads with implicit VR,
        // but the catalogue prefers explicit VR
        let out = negotiate_presentation_contexts(
            &[proposed(3, VERIFICATION, &[IMPLICIT_VR_LE, EXPLICIT_VR_LE])],
            &catalogue(),
            &[Cow::from(EXPLICIT_VR_LE), Cow::from(IMPLICIT_VR_LE)],
            false,
        );
        assert!(out[0].is_accepted());
        assert_eq!(out[0].transfer_syntax, EXPLICIT_VR_LE);
        assert_eq!(out[0].id, 3);
    }

    #[test]
    fn rejects_unknown_abstract_syntax_individually() {
        let out = negotiate_presentation_contexts(
            &[
                proposed(1, VERIFICATION, &[IMPLICIT_VR_LE]),
                proposed(3, MR_STORAGE, &[IMPLICIT_VR_LE]),
            ],
            &catalogue(),
            &[],
            false,
        );
        assert!(out[0].is_accepted());
        assert_eq!(
            out[1].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
        // context IDs are never renumbered
        assert_eq!(out[1].id, 3);
    }

    #[test]
    fn rejects_on_empty_transfer_syntax_intersection() {
        let out = negotiate_presentation_contexts(
            &[proposed(1, VERIFICATION, &[EXPLICIT_VR_LE])],
            &catalogue(),
            &[Cow::from(IMPLICIT_VR_LE)],
            false,
        );
        assert_eq!(
            out[0].reason,
            PresentationContextResultReason::TransferSyntaxesNotSupported
        );
    }

    #[test]
    fn promiscuous_mode_admits_any_abstract_syntax() {
        let out = negotiate_presentation_contexts(
            &[proposed(1, MR_STORAGE, &[IMPLICIT_VR_LE])],
            &catalogue(),
            &[],
            true,
        );
        assert!(out[0].is_accepted());
    }

    #[rstest]
    #[case(&[IMPLICIT_VR_LE, EXPLICIT_VR_LE])]
    #[case(&[EXPLICIT_VR_LE, IMPLICIT_VR_LE])]
    #[case(&[IMPLICIT_VR_LE])]
    fn accepted_transfer_syntax_is_a_proposed_candidate(#[case] candidates: &[&str]) {
        let out = negotiate_presentation_contexts(
            &[proposed(1, VERIFICATION, candidates)],
            &catalogue(),
            &[Cow::from(EXPLICIT_VR_LE), Cow::from(IMPLICIT_VR_LE)],
            false,
        );
        assert!(out[0].is_accepted());
        assert!(candidates.contains(&out[0].transfer_syntax.as_str()));
    }

    #[test]
    fn negotiation_is_deterministic() {
        let proposal = [
            proposed(1, VERIFICATION, &[EXPLICIT_VR_LE, IMPLICIT_VR_LE]),
            proposed(3, MR_STORAGE, &[IMPLICIT_VR_LE]),
        ];
        let first = negotiate_presentation_contexts(&proposal, &catalogue(), &[], false);
        for _ in 0..10 {
            let again = negotiate_presentation_contexts(&proposal, &catalogue(), &[], false);
            assert_eq!(first, again);
        }
    }

    #[test]
    fn roles_are_answered_with_the_supported_intersection() {
        let mut supported = HashMap::new();
        supported.insert(MR_STORAGE.to_string(), (true, false));

        let proposed_items = vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: MR_STORAGE.to_string(),
                scu_role: true,
                scp_role: true,
            }),
            // unconfigured SOP class: no answer, default role handling
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: VERIFICATION.to_string(),
                scu_role: true,
                scp_role: false,
            }),
        ];

        let answers = negotiate_roles(&proposed_items, &supported);
        assert_eq!(
            answers,
            vec![UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: MR_STORAGE.to_string(),
                scu_role: true,
                scp_role: false,
            })]
        );
    }
}
