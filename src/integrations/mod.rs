//! Collaborators at the edges of the core.

pub mod storage {
    pub use crate::storage::*;
}

pub mod audit {
    pub use crate::audit::*;
}

pub mod review {
    pub use crate::review::*;
}

pub mod interchange {
    pub use crate::importer::*;
    pub use crate::vcard::{serialize, serialize_all};
}
