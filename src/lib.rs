pub mod generate;
pub mod layer;
#[cfg(feature = "mamba")]
pub mod mamba_block;
pub mod model;
pub mod optim;
pub mod utils;

pub mod prelude {
    pub use crate::generate::TokenGenerator;
    pub use crate::layer::*;
    #[cfg(feature = "mamba")]
    pub use crate::mamba_block::*;
    pub use crate::model::*;
    pub use crate::optim::*;
}
