#![deny(dead_code)]
#![deny(unused_imports)]

//! Reverse-mode analytic gradients for Gaussian tree likelihoods under a
//! multivariate Ornstein-Uhlenbeck trait-evolution model.
//!
//! The crate turns adjoints of a node's canonical Gaussian parameters into
//! gradients with respect to the free model parameters, one branch at a
//! time: message backprop onto branch quantities, a strategy pushing those
//! onto the primitive OU parameters (selection S, stationary covariance,
//! optimum, optionally the diffusion), and chain-rule mappers down to the
//! concrete parameterization.

pub mod backprop;
pub mod block;
pub mod gradient;
pub mod linalg;
pub mod mappers;
pub mod strategy;
pub mod types;

pub use backprop::backprop_messages;
pub use block::{BasisChange, BlockStructure, CompressedBlockDiagonal};
pub use gradient::{
    BranchCacheProvider, BranchGradient, BroadcastAdjointProvider, CanonicalAdjointProvider,
    MapCacheProvider,
};
pub use mappers::{
    CompositeMapper, CompoundSymmetricMapper, CosSinRotationMapper, OptimumMapper,
    ParameterMapper,
};
pub use strategy::{BlockDiagonalizableBackprop, GeneralBackprop, PrimitiveBackprop};
pub use types::{
    BranchAdjointSet, BranchCache, CanonicalAdjoint, GradientConfig, GradientError,
    PrimitiveGradientSet,
};
