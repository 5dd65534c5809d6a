//! Unit-aware exact-decimal values (spec §4.1) — the `UnitValue` pair and the
//! context-aware `UnitConverter` that resolves ratios against current engine
//! state (initial charge, GHG intensity, population, elapsed time).

mod convert;
mod value;

pub use convert::{ConversionContext, PercentMode, UnitConverter};
pub use value::{divide_exact, Atom, Unit, UnitValue, DIVISION_SCALE};
