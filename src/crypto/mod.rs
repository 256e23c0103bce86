pub mod ecma376_agile;
pub mod ecma376_standard;
pub mod primitives;
