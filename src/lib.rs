//! Root crate for the Nexus Core workspace. Carries no library code of
//! its own — workspace-level integration tests live under `tests/`.
