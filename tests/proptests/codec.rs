//! Property-Based Tests: IGMP Codec
//!
//! These tests use the `proptest` framework to generate a wide variety
//! of inputs to throw at the IGMP codec. The goal is to test the
//! decoder's robustness against unexpected, malformed, or edge-case
//! inputs that might not be covered by simple unit tests, and to pin
//! down the encode/decode relationship for well-formed messages.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use querierd::packet::{
        DecodeError, Message, Query, QueryVersion, RecordType, ReportRecord,
    };
    use std::net::Ipv4Addr;

    fn multicast_addr() -> impl Strategy<Value = Ipv4Addr> {
        // 224.0.1.0 .. 239.255.255.255, avoiding the link-local /24
        (224u8..=239, 0u8..=255, 1u8..=255, 0u8..=255)
            .prop_map(|(a, b, c, d)| Ipv4Addr::new(a, b, c, d))
    }

    fn unicast_addr() -> impl Strategy<Value = Ipv4Addr> {
        (1u8..=223, any::<u8>(), any::<u8>(), any::<u8>())
            .prop_map(|(a, b, c, d)| Ipv4Addr::new(a, b, c, d))
    }

    fn v2_query() -> impl Strategy<Value = Query> {
        (any::<u8>(), prop_oneof![Just(None), multicast_addr().prop_map(Some)]).prop_map(
            |(code, group)| match group {
                None => Query::general_v2(code),
                Some(group) => Query::group_specific_v2(group, code),
            },
        )
    }

    fn v3_query() -> impl Strategy<Value = Query> {
        (
            any::<u8>(),
            0u8..8,
            any::<u8>(),
            prop_oneof![Just(None), multicast_addr().prop_map(Some)],
            prop::collection::vec(unicast_addr(), 0..4),
        )
            .prop_map(|(code, qrv, qqic, group, sources)| match group {
                None => Query::general_v3(code, qrv, qqic),
                Some(group) => Query::group_specific_v3(group, code, qrv, qqic, sources),
            })
    }

    fn record_type() -> impl Strategy<Value = RecordType> {
        prop_oneof![
            Just(RecordType::ModeIsInclude),
            Just(RecordType::ModeIsExclude),
            Just(RecordType::ChangeToInclude),
            Just(RecordType::ChangeToExclude),
            Just(RecordType::AllowNewSources),
            Just(RecordType::BlockOldSources),
        ]
    }

    fn report_record() -> impl Strategy<Value = ReportRecord> {
        (
            record_type(),
            multicast_addr(),
            prop::collection::vec(unicast_addr(), 0..4),
        )
            .prop_map(|(record_type, group, sources)| ReportRecord {
                record_type,
                group,
                sources,
            })
    }

    fn message() -> impl Strategy<Value = Message> {
        prop_oneof![
            v2_query().prop_map(Message::Query),
            v3_query().prop_map(Message::Query),
            multicast_addr().prop_map(|group| Message::ReportV1 { group }),
            multicast_addr().prop_map(|group| Message::ReportV2 { group }),
            multicast_addr().prop_map(|group| Message::Leave { group }),
            prop::collection::vec(report_record(), 1..4)
                .prop_map(|records| Message::ReportV3 { records }),
        ]
    }

    proptest! {
        /// **Property:** `Message::decode` never panics, whatever the
        /// input bytes look like.
        #[test]
        fn test_decode_does_not_panic(input in any::<Vec<u8>>()) {
            let _ = Message::decode(&input);
        }

        /// **Property:** well-formed messages survive an encode/decode
        /// round trip unchanged.
        #[test]
        fn test_encode_decode_roundtrip(message in message()) {
            let bytes = message.encode();
            let decoded = Message::decode(&bytes).expect("own encoding must decode");
            prop_assert_eq!(decoded, message);
        }

        /// **Property:** any single-bit corruption of a valid packet is
        /// caught by the checksum, regardless of which byte was hit.
        #[test]
        fn test_single_bit_flip_is_detected(
            message in message(),
            byte_seed in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut bytes = message.encode();
            let index = byte_seed.index(bytes.len());
            bytes[index] ^= 1 << bit;
            let result = Message::decode(&bytes);
            prop_assert!(
                matches!(result, Err(DecodeError::ChecksumMismatch { .. })),
                "corruption at byte {} bit {} not detected: {:?}",
                index, bit, result
            );
        }

        /// **Property:** decoded queries report a max response duration
        /// consistent with their version's encoding.
        #[test]
        fn test_decoded_query_duration_is_bounded(query in v3_query()) {
            let bytes = Message::Query(query.clone()).encode();
            let Ok(Message::Query(decoded)) = Message::decode(&bytes) else {
                return Err(TestCaseError::fail("query did not decode"));
            };
            prop_assert_eq!(decoded.version, QueryVersion::V3);
            prop_assert_eq!(decoded.max_resp_code, query.max_resp_code);
        }
    }
}
