pub mod cloud;
pub mod schema;

#[must_use]
pub fn adapter_name() -> &'static str {
    "dxb-adapters"
}
