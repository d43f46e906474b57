//! Round-trip tests for the PDU codec.
use std::io::Cursor;

use matches::matches;

use dicom_net::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ,
    PDataValue, PDataValueType, Pdu, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, RoleSelection, UserIdentity, UserIdentityType,
    UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
};

fn round_trip(pdu: &Pdu) -> Pdu {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu).expect("encoding should succeed");
    let mut cursor = Cursor::new(&bytes[..]);
    let decoded = read_pdu(&mut cursor, MAXIMUM_PDU_SIZE, true)
        .expect("decoding should succeed")
        .expect("the full PDU is in the buffer");
    assert_eq!(cursor.position(), bytes.len() as u64, "no trailing bytes");
    decoded
}

#[test]
fn associate_rq_round_trip() {
    let pdu: Pdu = AssociationRQ {
        protocol_version: 1,
        // maximum length AE titles: 16 characters
        calling_ae_title: "QUERY-RETRIEVESC".to_string(),
        called_ae_title: "MAIN-ARCHIVE-001".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2".to_string(),
                    "1.2.840.10008.1.2.1".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.4".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2.1".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::ImplementationClassUID("1.2.826.0.1.3680043.2.1396.999".to_string()),
            UserVariableItem::ImplementationVersionName("TESTNODE-1.0".to_string()),
            UserVariableItem::AsyncOperationsWindow(4, 1),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.4".to_string(),
                scu_role: true,
                scp_role: false,
            }),
            UserVariableItem::SopClassExtendedNegotiationSubItem(
                "1.2.840.10008.5.1.4.1.2.2.1".to_string(),
                vec![1, 0, 1],
            ),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                false,
                UserIdentityType::UsernamePassword,
                b"username".to_vec(),
                b"password".to_vec(),
            )),
        ],
    }
    .into();

    assert_eq!(round_trip(&pdu), pdu);
}

#[test]
fn associate_rq_with_zero_presentation_contexts() {
    let pdu: Pdu = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "A".to_string(),
        called_ae_title: "B".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![],
        user_variables: vec![UserVariableItem::MaxLength(0)],
    }
    .into();

    assert_eq!(round_trip(&pdu), pdu);
}

#[test]
fn associate_ac_round_trip() {
    let pdu: Pdu = AssociationAC {
        protocol_version: 1,
        calling_ae_title: "ECHO-SCU".to_string(),
        called_ae_title: "ECHO-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(32768),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.4".to_string(),
                scu_role: true,
                scp_role: false,
            }),
        ],
    }
    .into();

    assert_eq!(round_trip(&pdu), pdu);
}

#[test]
fn associate_rj_round_trip() {
    let pdu: Pdu = AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CallingAETitleNotRecognized,
        ),
    }
    .into();

    assert_eq!(round_trip(&pdu), pdu);
}

#[test]
fn release_and_abort_round_trips() {
    assert_eq!(round_trip(&Pdu::ReleaseRQ), Pdu::ReleaseRQ);
    assert_eq!(round_trip(&Pdu::ReleaseRP), Pdu::ReleaseRP);

    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    };
    assert_eq!(round_trip(&abort), abort);
}

#[test]
fn pdata_round_trip() {
    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x11; 68],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0x22; 1024],
            },
        ],
    };

    assert_eq!(round_trip(&pdu), pdu);
}

#[test]
fn unknown_pdu_type_is_preserved() {
    let pdu = Pdu::Unknown {
        pdu_type: 0x99,
        data: vec![1, 2, 3, 4],
    };
    assert_eq!(round_trip(&pdu), pdu);
}

#[test]
fn incomplete_frames_wait_for_more_data() {
    let mut bytes = Vec::new();
    write_pdu(
        &mut bytes,
        &Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        },
    )
    .unwrap();

    // any strict prefix of the frame decodes to "not yet"
    for len in 0..bytes.len() {
        let mut cursor = Cursor::new(&bytes[..len]);
        assert!(
            read_pdu(&mut cursor, DEFAULT_MAX_PDU, true).unwrap().is_none(),
            "prefix of {} bytes should be incomplete",
            len
        );
    }

    let mut cursor = Cursor::new(&bytes[..]);
    assert!(read_pdu(&mut cursor, DEFAULT_MAX_PDU, true).unwrap().is_some());
}

#[test]
fn strict_mode_refuses_oversized_pdus() {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0u8; 8192],
        }],
    };
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();

    let mut cursor = Cursor::new(&bytes[..]);
    let err = read_pdu(&mut cursor, 4096, true).unwrap_err();
    assert!(matches!(
        err,
        dicom_net::pdu::reader::Error::PduTooLarge { .. }
    ));

    // non-strict mode admits it with a warning
    let mut cursor = Cursor::new(&bytes[..]);
    assert_eq!(
        read_pdu(&mut cursor, 4096, false).unwrap(),
        Some(pdu)
    );
}

#[test]
fn bad_reject_codes_are_decode_errors() {
    let mut bytes = Vec::new();
    write_pdu(
        &mut bytes,
        &Pdu::AssociationRJ(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven),
        }),
    )
    .unwrap();
    // corrupt the result code
    bytes[7] = 0x77;

    let mut cursor = Cursor::new(&bytes[..]);
    assert!(read_pdu(&mut cursor, DEFAULT_MAX_PDU, true).is_err());
}
