//! Mesh fragments as handed to the engine by the surrounding pipeline.

pub mod fragment;

pub use fragment::{Cell, Centering, Field, FragmentGeometry, MeshFragment};
