#![expect(clippy::unwrap_used)]

mod postgres;
