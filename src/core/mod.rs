// Record-level stages: compliance first, then deduplication
pub mod compliance {
    pub use crate::compliance::*;
    pub use crate::repairer::*;
    pub use crate::rewriter::*;
    pub use crate::validator::*;
}

pub mod dedup {
    pub use crate::blocking::*;
    pub use crate::executor::*;
    pub use crate::merge::*;
    pub use crate::scoring::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
