/// Issues accelerator transfer ids: 16 lowercase hex characters.
#[derive(Debug, Default)]
pub struct GidGenerator;

impl GidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_gid(&mut self) -> String {
        format!("{:016x}", rand::random::<u64>())
    }
}

/// Id distinguishing re-downloads of the same video.
pub fn new_instance_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}
