//! End-to-end smoke tests for the compliance events API live under `tests/`.
