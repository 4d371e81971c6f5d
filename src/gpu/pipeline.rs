use std::sync::Arc;

use crate::error::{Error, Result};
use crate::spirv::{BindingInfo, Reflection, ScalarType};

use super::backend::{OwnedHandle, RawHandle};

#[derive(Debug)]
pub(crate) struct ModuleShared {
    pub(crate) handle: OwnedHandle,
    pub(crate) reflection: Reflection,
}

/// The resource layout of one descriptor set declared by a shader module.
///
/// Two layouts compare equal only when they come from the same module and
/// describe the same set index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayout {
    module: RawHandle,
    set: u32,
    bindings: Vec<BindingInfo>,
}

impl DescriptorSetLayout {
    pub fn set(&self) -> u32 {
        self.set
    }

    pub fn bindings(&self) -> &[BindingInfo] {
        &self.bindings
    }

    pub(crate) fn module(&self) -> RawHandle {
        self.module
    }
}

/// A loaded compute kernel and the binding layout it declares.
#[derive(Debug)]
pub struct ShaderModule {
    shared: Arc<ModuleShared>,
    layouts: Vec<DescriptorSetLayout>,
}

impl ShaderModule {
    pub(crate) fn new(handle: OwnedHandle, reflection: Reflection) -> Self {
        let module = handle.raw();
        let mut layouts: Vec<DescriptorSetLayout> = Vec::new();
        for binding in &reflection.bindings {
            match layouts.last_mut() {
                Some(layout) if layout.set == binding.set => layout.bindings.push(*binding),
                _ => layouts.push(DescriptorSetLayout {
                    module,
                    set: binding.set,
                    bindings: vec![*binding],
                }),
            }
        }
        Self {
            shared: Arc::new(ModuleShared { handle, reflection }),
            layouts,
        }
    }

    /// Declared layouts, ordered by set index.
    pub fn descriptor_set_layouts(&self) -> &[DescriptorSetLayout] {
        &self.layouts
    }

    pub fn reflection(&self) -> &Reflection {
        &self.shared.reflection
    }

    pub(crate) fn raw(&self) -> RawHandle {
        self.shared.handle.raw()
    }

    pub(crate) fn shared(&self) -> &Arc<ModuleShared> {
        &self.shared
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpecValue {
    Bool(bool),
    I32(i32),
    U32(u32),
    F32(f32),
}

impl SpecValue {
    pub fn scalar_type(self) -> ScalarType {
        match self {
            SpecValue::Bool(_) => ScalarType::Bool,
            SpecValue::I32(_) => ScalarType::I32,
            SpecValue::U32(_) => ScalarType::U32,
            SpecValue::F32(_) => ScalarType::F32,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            SpecValue::Bool(b) => f64::from(u8::from(b)),
            SpecValue::I32(v) => f64::from(v),
            SpecValue::U32(v) => f64::from(v),
            SpecValue::F32(v) => f64::from(v),
        }
    }
}

/// A scalar baked into a pipeline at creation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpecConstant {
    pub id: u32,
    pub value: SpecValue,
}

impl SpecConstant {
    pub fn s32(id: u32, value: i32) -> Self {
        Self {
            id,
            value: SpecValue::I32(value),
        }
    }

    pub fn u32(id: u32, value: u32) -> Self {
        Self {
            id,
            value: SpecValue::U32(value),
        }
    }

    pub fn f32(id: u32, value: f32) -> Self {
        Self {
            id,
            value: SpecValue::F32(value),
        }
    }
}

/// Checks `supplied` against what the module declares and returns the
/// constants to hand to the backend, in declaration order.
pub(crate) fn resolve_spec_constants(
    reflection: &Reflection,
    supplied: &[SpecConstant],
) -> Result<Vec<SpecConstant>> {
    for constant in supplied {
        if !reflection.spec_constants.iter().any(|c| c.id == constant.id) {
            log::warn!(
                "ignoring specialization constant {} not declared by the shader module",
                constant.id
            );
        }
    }

    reflection
        .spec_constants
        .iter()
        .map(|declared| {
            let constant = supplied
                .iter()
                .rev()
                .find(|c| c.id == declared.id)
                .ok_or(Error::MissingSpecializationConstant { id: declared.id })?;
            let supplied_ty = constant.value.scalar_type();
            if supplied_ty != declared.ty {
                return Err(Error::SpecConstantTypeMismatch {
                    id: declared.id,
                    declared: declared.ty.name(),
                    supplied: supplied_ty.name(),
                });
            }
            Ok(*constant)
        })
        .collect()
}

#[derive(Debug)]
pub(crate) struct PipelineShared {
    pub(crate) handle: OwnedHandle,
    pub(crate) module: Arc<ModuleShared>,
}

/// A dispatch-ready compute pipeline.
#[derive(Debug)]
pub struct Pipeline {
    shared: Arc<PipelineShared>,
    entry_point: String,
    workgroup_size: [u32; 3],
    constants: Vec<SpecConstant>,
}

impl Pipeline {
    pub(crate) fn new(
        handle: OwnedHandle,
        module: &ShaderModule,
        entry_point: &str,
        workgroup_size: [u32; 3],
        constants: Vec<SpecConstant>,
    ) -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                handle,
                module: module.shared().clone(),
            }),
            entry_point: entry_point.to_string(),
            workgroup_size,
            constants,
        }
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Invocations per workgroup along each axis, as declared by the kernel.
    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    pub fn constants(&self) -> &[SpecConstant] {
        &self.constants
    }

    pub(crate) fn shared(&self) -> &Arc<PipelineShared> {
        &self.shared
    }

    pub(crate) fn module_raw(&self) -> RawHandle {
        self.shared.module.handle.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spirv::SpecConstantInfo;

    fn reflection_with(constants: &[(u32, ScalarType)]) -> Reflection {
        Reflection {
            spec_constants: constants
                .iter()
                .map(|&(id, ty)| SpecConstantInfo { id, ty })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn missing_constant_is_reported_by_id() {
        let reflection = reflection_with(&[(0, ScalarType::I32), (3, ScalarType::F32)]);
        let err = resolve_spec_constants(&reflection, &[SpecConstant::s32(0, 8)]).unwrap_err();
        assert!(matches!(err, Error::MissingSpecializationConstant { id: 3 }));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let reflection = reflection_with(&[(0, ScalarType::I32)]);
        let err = resolve_spec_constants(&reflection, &[SpecConstant::u32(0, 8)]).unwrap_err();
        assert!(matches!(
            err,
            Error::SpecConstantTypeMismatch {
                id: 0,
                declared: "s32",
                supplied: "u32"
            }
        ));
    }

    #[test]
    fn undeclared_constants_are_dropped() {
        let reflection = reflection_with(&[(0, ScalarType::I32)]);
        let resolved = resolve_spec_constants(
            &reflection,
            &[SpecConstant::f32(7, 1.5), SpecConstant::s32(0, 64)],
        )
        .unwrap();
        assert_eq!(resolved, vec![SpecConstant::s32(0, 64)]);
    }
}
