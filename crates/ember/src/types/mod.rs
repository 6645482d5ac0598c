pub(crate) mod generator;
pub(crate) mod iter;

pub(crate) use generator::FinalizerQueue;
pub use generator::GeneratorRef;
pub use generator::{GeneratorKind, GeneratorMethod, GeneratorState};
pub use iter::{Range, SeqIter};
