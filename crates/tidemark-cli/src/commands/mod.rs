pub mod history;
pub mod render_manifest;
pub mod validate;
pub mod watermark;
