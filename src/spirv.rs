//! SPIR-V reflection on top of naga.
//!
//! A module is parsed and validated by naga, then reduced to what the device
//! layer needs: compute entry points with their workgroup size, descriptor
//! bindings and specialization constants.

use std::collections::BTreeMap;

use naga::front::spv;
use naga::valid::{Capabilities, GlobalUse, ModuleInfo, ValidationFlags, Validator};
use naga::{AddressSpace, ScalarKind, ShaderStage, StorageAccess, TypeInner};

use crate::error::{Error, Result};

/// SPIR-V magic number (first word of every module).
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Primitive type of a specialization constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Bool,
    I32,
    U32,
    F32,
}

impl ScalarType {
    pub fn name(self) -> &'static str {
        match self {
            ScalarType::Bool => "bool",
            ScalarType::I32 => "s32",
            ScalarType::U32 => "u32",
            ScalarType::F32 => "f32",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub name: String,
    pub workgroup_size: [u32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    StorageBuffer,
    UniformBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingInfo {
    pub set: u32,
    pub binding: u32,
    pub kind: BindingKind,
    /// The declared storage access has no `STORE`. Pipeline layouts must
    /// match this exactly.
    pub read_only: bool,
    /// Some compute entry point stores to the binding.
    pub written: bool,
    /// Stride of the block's first member when it is an array.
    pub array_stride: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecConstantInfo {
    pub id: u32,
    pub ty: ScalarType,
}

/// What a module declares, in deterministic order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reflection {
    pub entry_points: Vec<EntryPoint>,
    /// Sorted by `(set, binding)`.
    pub bindings: Vec<BindingInfo>,
    /// Sorted by id.
    pub spec_constants: Vec<SpecConstantInfo>,
}

impl Reflection {
    pub fn entry_point(&self, name: &str) -> Option<&EntryPoint> {
        self.entry_points.iter().find(|e| e.name == name)
    }

    pub fn binding(&self, set: u32, binding: u32) -> Option<&BindingInfo> {
        self.bindings
            .iter()
            .find(|b| b.set == set && b.binding == binding)
    }
}

/// Converts a little-endian byte blob into SPIR-V words.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::InvalidShaderBinary(format!(
            "binary length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Parses and validates `words`, then extracts the module's interface.
pub fn reflect(words: &[u32]) -> Result<Reflection> {
    let options = spv::Options {
        adjust_coordinate_space: false,
        strict_capabilities: false,
        block_ctx_dump_prefix: None,
    };
    let module = spv::Frontend::new(words.iter().copied(), &options)
        .parse()
        .map_err(|e| invalid(format!("parse error: {e}")))?;
    let info = Validator::new(ValidationFlags::all(), Capabilities::default())
        .validate(&module)
        .map_err(|e| invalid(format!("validation error: {e}")))?;

    let entry_points: Vec<EntryPoint> = module
        .entry_points
        .iter()
        .filter(|e| e.stage == ShaderStage::Compute)
        .map(|e| EntryPoint {
            name: e.name.clone(),
            workgroup_size: e.workgroup_size,
        })
        .collect();
    if entry_points.is_empty() {
        return Err(invalid("module declares no compute entry point".into()));
    }

    Ok(Reflection {
        entry_points,
        bindings: bindings(&module, &info)?,
        spec_constants: spec_constants(&module)?,
    })
}

fn bindings(module: &naga::Module, info: &ModuleInfo) -> Result<Vec<BindingInfo>> {
    let mut bindings = BTreeMap::new();
    for (handle, var) in module.global_variables.iter() {
        let (kind, access) = match var.space {
            AddressSpace::Storage { access } => (BindingKind::StorageBuffer, access),
            AddressSpace::Uniform => (BindingKind::UniformBuffer, StorageAccess::LOAD),
            _ => continue,
        };
        let Some(rb) = &var.binding else {
            continue;
        };
        let written = module
            .entry_points
            .iter()
            .enumerate()
            .filter(|(_, e)| e.stage == ShaderStage::Compute)
            .any(|(i, _)| info.get_entry_point(i)[handle].contains(GlobalUse::WRITE));
        let array_stride = match &module.types[var.ty].inner {
            TypeInner::Struct { members, .. } => match members.first() {
                Some(member) => match module.types[member.ty].inner {
                    TypeInner::Array { stride, .. } => Some(stride),
                    _ => None,
                },
                None => None,
            },
            TypeInner::Array { stride, .. } => Some(*stride),
            _ => None,
        };
        let entry = BindingInfo {
            set: rb.group,
            binding: rb.binding,
            kind,
            read_only: !access.contains(StorageAccess::STORE),
            written,
            array_stride,
        };
        if bindings.insert((rb.group, rb.binding), entry).is_some() {
            return Err(invalid(format!(
                "binding ({}, {}) is declared more than once",
                rb.group, rb.binding
            )));
        }
    }
    Ok(bindings.into_values().collect())
}

fn spec_constants(module: &naga::Module) -> Result<Vec<SpecConstantInfo>> {
    let mut constants = Vec::new();
    for (_, o) in module.overrides.iter() {
        let Some(id) = o.id else {
            continue;
        };
        let ty = match module.types[o.ty].inner {
            TypeInner::Scalar(scalar) => match (scalar.kind, scalar.width) {
                (ScalarKind::Bool, _) => ScalarType::Bool,
                (ScalarKind::Sint, 4) => ScalarType::I32,
                (ScalarKind::Uint, 4) => ScalarType::U32,
                (ScalarKind::Float, 4) => ScalarType::F32,
                _ => {
                    return Err(invalid(format!(
                        "specialization constant {id} has an unsupported type"
                    )))
                }
            },
            _ => {
                return Err(invalid(format!(
                    "specialization constant {id} is not a scalar"
                )))
            }
        };
        constants.push(SpecConstantInfo {
            id: u32::from(id),
            ty,
        });
    }
    constants.sort_by_key(|c| c.id);
    Ok(constants)
}

fn invalid(msg: String) -> Error {
    Error::InvalidShaderBinary(msg)
}
