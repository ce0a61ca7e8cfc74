//! Property-based tests for Pathlink address handling
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Domain identity properties
// ============================================================================

mod isd_as_properties {
    use super::*;
    use pathlink_core::IsdAs;
    use pathlink_core::addr::MAX_AS;

    proptest! {
        /// Display then parse yields the same identity
        #[test]
        fn isd_as_roundtrip(isd in any::<u16>(), asn in 0u64..=MAX_AS) {
            let ia = IsdAs::new(isd, asn);
            let parsed: IsdAs = ia.to_string().parse().unwrap();
            prop_assert_eq!(parsed, ia);
        }

        /// Large AS numbers always print in the colon-separated hex form
        #[test]
        fn large_asn_uses_hex_groups(isd in any::<u16>(), asn in (1u64 << 32)..=MAX_AS) {
            let text = IsdAs::new(isd, asn).to_string();
            let (_, asn_text) = text.split_once('-').unwrap();
            prop_assert_eq!(asn_text.split(':').count(), 3);
        }
    }
}

// ============================================================================
// Address parsing properties
// ============================================================================

mod address_properties {
    use super::*;
    use pathlink_core::addr::MAX_AS;
    use pathlink_core::{
        Address, AddressParser, DEFAULT_PORT, IsdAs, PathAddr, is_valid_address, join_host_port,
        parse_address, split_host_port,
    };
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn host() -> impl Strategy<Value = IpAddr> {
        prop_oneof![
            any::<[u8; 4]>().prop_map(|o| IpAddr::V4(Ipv4Addr::from(o))),
            any::<[u16; 8]>().prop_map(|s| IpAddr::V6(Ipv6Addr::from(s))),
        ]
    }

    fn path_addr() -> impl Strategy<Value = PathAddr> {
        (any::<u16>(), 0u64..=MAX_AS, host(), any::<u16>())
            .prop_map(|(isd, asn, host, port)| PathAddr::new(IsdAs::new(isd, asn), host, port))
    }

    proptest! {
        /// The canonical form parses back to the same address
        #[test]
        fn canonical_roundtrip(addr in path_addr()) {
            let text = addr.to_string();
            prop_assert_eq!(parse_address(&text).unwrap(), addr.clone());
            prop_assert_eq!(is_valid_address(&text), Some(addr));
        }

        /// Parsing never panics, whatever the input
        #[test]
        fn parse_never_panics(input in ".{0,64}") {
            let parser = AddressParser::default();
            let _ = parser.classify(&input);
            let _ = split_host_port(&input);
            let _ = is_valid_address(&input);
        }

        /// Inputs shaped like addresses never panic either
        #[test]
        fn address_like_never_panics(input in "[0-9]{1,6}-[0-9a-f:]{1,16},[0-9a-f:.\\[\\]%]{0,40}(:[0-9]{0,6})?") {
            let _ = AddressParser::default().classify(&input);
            let _ = split_host_port(&input);
        }

        /// Omitted ports are filled in from the parser
        #[test]
        fn missing_port_gets_default(addr in path_addr(), port in 1u16..) {
            let (host, explicit) = split_host_port(&addr.to_string()).unwrap();
            prop_assert_eq!(explicit, Some(addr.port));

            let parsed = parse_address(&host).unwrap();
            prop_assert_eq!(parsed.port, DEFAULT_PORT);
            let custom = AddressParser::with_default_port(port).parse(&host).unwrap();
            prop_assert_eq!(custom.port, port);
            prop_assert_eq!(custom.host, addr.host);
        }

        /// Split then join restores the canonical form
        #[test]
        fn split_join_inverse(addr in path_addr()) {
            let text = addr.to_string();
            let (host, port) = split_host_port(&text).unwrap();
            prop_assert_eq!(join_host_port(&host, port.unwrap()), text);
        }

        /// Host names with a port stay conventional
        #[test]
        fn host_names_are_conventional(
            name in "[a-z][a-z0-9-]{0,15}(\\.[a-z]{2,6}){0,2}",
            port in any::<u16>(),
        ) {
            let input = join_host_port(&name, port);
            match AddressParser::default().classify(&input).unwrap() {
                Address::Conventional { host, port: parsed } => {
                    prop_assert_eq!(host, name);
                    prop_assert_eq!(parsed, port);
                }
                Address::PathAware(addr) => prop_assert!(false, "classified as {addr}"),
            }
            prop_assert!(is_valid_address(&input).is_none());
        }
    }
}
