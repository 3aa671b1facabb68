pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

#[derive(Debug, Clone)]
pub struct BuilderParams {
    pub frames_in_flight: usize,
    pub rebuild_budget: u32,
    pub compaction: bool,
    pub pool_granularity: usize,
    pub ray_tracing_supported: bool,
}

impl BuilderParams {
    pub fn parse_arg(&mut self, s: &str) -> bool {
        if let Some(value) = s.strip_prefix("--frames-in-flight=") {
            return match value.parse::<usize>() {
                Ok(n) if (1..=MAX_FRAMES_IN_FLIGHT).contains(&n) => {
                    self.frames_in_flight = n;
                    true
                }
                _ => false,
            };
        }
        if let Some(value) = s.strip_prefix("--rebuild-budget=") {
            return match value.parse::<u32>() {
                Ok(n) => {
                    self.rebuild_budget = n;
                    true
                }
                Err(_) => false,
            };
        }
        match s {
            "--compact" => {
                self.compaction = true;
                true
            }
            "--no-ray-tracing" => {
                self.ray_tracing_supported = false;
                true
            }
            _ => false,
        }
    }
}

impl Default for BuilderParams {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            rebuild_budget: 10,
            compaction: false,
            pool_granularity: 64,
            ray_tracing_supported: true,
        }
    }
}
