//! Conformance suites shared with backend crates
