/// JSON roundtrip proptest helpers.
pub mod roundtrip;
