// SPIR-V vertex input reflection
//
// Walks the module's instruction stream, collects the vertex entry point's
// `Input` variables and turns them into vertex bindings: one for per-vertex
// attributes and one for per-instance attributes, classified by name.

use ash::vk;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

const SPIRV_MAGIC: u32 = 0x0723_0203;
const HEADER_WORDS: usize = 5;

const OP_NAME: u32 = 5;
const OP_ENTRY_POINT: u32 = 15;
const OP_TYPE_INT: u32 = 21;
const OP_TYPE_FLOAT: u32 = 22;
const OP_TYPE_VECTOR: u32 = 23;
const OP_TYPE_MATRIX: u32 = 24;
const OP_TYPE_STRUCT: u32 = 30;
const OP_TYPE_POINTER: u32 = 32;
const OP_VARIABLE: u32 = 59;
const OP_DECORATE: u32 = 71;
const OP_MEMBER_DECORATE: u32 = 72;

const DECORATION_BUILT_IN: u32 = 11;
const DECORATION_LOCATION: u32 = 30;
const STORAGE_CLASS_INPUT: u32 = 1;
const EXECUTION_MODEL_VERTEX: u32 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReflectError {
    #[error("bytecode is not SPIR-V: {0}")]
    Malformed(&'static str),
    #[error("vertex input '{0}' has no explicit location")]
    MissingLocation(String),
    #[error("vertex inputs '{first}' and '{second}' both use location {location}")]
    DuplicateLocation {
        location: u32,
        first: String,
        second: String,
    },
    #[error("vertex input '{0}' has a type that cannot be fed from a vertex buffer")]
    UnsupportedType(String),
}

/// Attribute formats a vertex buffer can feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float,
    Float2,
    Float3,
    Float4,
    Int,
    Int2,
    Int3,
    Int4,
    UInt,
    UInt2,
    UInt3,
    UInt4,
}

impl VertexFormat {
    fn from_scalar(scalar: Scalar, components: u32) -> Option<Self> {
        use VertexFormat::*;
        let format = match (scalar, components) {
            (Scalar::Float, 1) => Float,
            (Scalar::Float, 2) => Float2,
            (Scalar::Float, 3) => Float3,
            (Scalar::Float, 4) => Float4,
            (Scalar::Int, 1) => Int,
            (Scalar::Int, 2) => Int2,
            (Scalar::Int, 3) => Int3,
            (Scalar::Int, 4) => Int4,
            (Scalar::UInt, 1) => UInt,
            (Scalar::UInt, 2) => UInt2,
            (Scalar::UInt, 3) => UInt3,
            (Scalar::UInt, 4) => UInt4,
            _ => return None,
        };
        Some(format)
    }

    /// Size in bytes
    pub fn size(self) -> u32 {
        use VertexFormat::*;
        match self {
            Float | Int | UInt => 4,
            Float2 | Int2 | UInt2 => 8,
            Float3 | Int3 | UInt3 => 12,
            Float4 | Int4 | UInt4 => 16,
        }
    }

    pub fn to_vk(self) -> vk::Format {
        use VertexFormat::*;
        match self {
            Float => vk::Format::R32_SFLOAT,
            Float2 => vk::Format::R32G32_SFLOAT,
            Float3 => vk::Format::R32G32B32_SFLOAT,
            Float4 => vk::Format::R32G32B32A32_SFLOAT,
            Int => vk::Format::R32_SINT,
            Int2 => vk::Format::R32G32_SINT,
            Int3 => vk::Format::R32G32B32_SINT,
            Int4 => vk::Format::R32G32B32A32_SINT,
            UInt => vk::Format::R32_UINT,
            UInt2 => vk::Format::R32G32_UINT,
            UInt3 => vk::Format::R32G32B32_UINT,
            UInt4 => vk::Format::R32G32B32A32_UINT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexAttribute {
    pub name: String,
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

/// One vertex buffer binding: its rate, stride and attributes in location order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexInputBinding {
    pub binding: u32,
    pub input_rate: vk::VertexInputRate,
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexInputBinding {
    pub fn description(&self) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: self.binding,
            stride: self.stride,
            input_rate: self.input_rate,
        }
    }

    pub fn attribute_descriptions(&self) -> impl Iterator<Item = vk::VertexInputAttributeDescription> + '_ {
        self.attributes.iter().map(|attr| vk::VertexInputAttributeDescription {
            location: attr.location,
            binding: self.binding,
            format: attr.format.to_vk(),
            offset: attr.offset,
        })
    }
}

/// Inputs fed per instance are recognised by name: `i_*`, `inst*`, or anything containing `instance`
pub fn is_per_instance(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("i_") || name.starts_with("inst") || name.contains("instance")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    Float,
    Int,
    UInt,
}

#[derive(Debug, Clone, Copy)]
enum Type {
    Scalar(Scalar, u32),
    Vector { component: u32, count: u32 },
    Matrix { column: u32, columns: u32 },
    Pointer { storage: u32, pointee: u32 },
    Other,
}

#[derive(Default)]
struct Module {
    names: HashMap<u32, String>,
    types: HashMap<u32, Type>,
    locations: HashMap<u32, u32>,
    builtins: HashSet<u32>,
    /// Structs with built-in members (gl_PerVertex and friends)
    builtin_structs: HashSet<u32>,
    /// (id, pointer type)
    input_variables: Vec<(u32, u32)>,
    vertex_interface: Option<Vec<u32>>,
}

fn decode_string(words: &[u32]) -> String {
    let bytes: Vec<u8> = words
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .take_while(|&b| b != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Number of words a literal string occupies, including the terminator
fn string_words(words: &[u32]) -> usize {
    words
        .iter()
        .position(|w| w.to_le_bytes().contains(&0))
        .map_or(words.len(), |i| i + 1)
}

fn parse(words: &[u32]) -> Result<Module, ReflectError> {
    if words.len() < HEADER_WORDS {
        return Err(ReflectError::Malformed("shorter than the header"));
    }
    if words[0] != SPIRV_MAGIC {
        return Err(ReflectError::Malformed("bad magic number"));
    }

    let mut module = Module::default();
    let mut cursor = HEADER_WORDS;

    while cursor < words.len() {
        let word_count = (words[cursor] >> 16) as usize;
        let opcode = words[cursor] & 0xffff;
        if word_count == 0 || cursor + word_count > words.len() {
            return Err(ReflectError::Malformed("truncated instruction"));
        }
        let ops = &words[cursor + 1..cursor + word_count];
        let operand = |i: usize| ops.get(i).copied().ok_or(ReflectError::Malformed("missing operand"));

        match opcode {
            OP_NAME => {
                module.names.insert(operand(0)?, decode_string(&ops[1..]));
            }
            OP_ENTRY_POINT => {
                if operand(0)? == EXECUTION_MODEL_VERTEX && module.vertex_interface.is_none() {
                    let name_start = 2;
                    let interface_start = name_start + string_words(&ops[name_start.min(ops.len())..]);
                    module.vertex_interface = Some(ops.get(interface_start..).unwrap_or_default().to_vec());
                }
            }
            OP_TYPE_INT => {
                let scalar = if operand(2)? == 0 { Scalar::UInt } else { Scalar::Int };
                module.types.insert(operand(0)?, Type::Scalar(scalar, operand(1)?));
            }
            OP_TYPE_FLOAT => {
                module.types.insert(operand(0)?, Type::Scalar(Scalar::Float, operand(1)?));
            }
            OP_TYPE_VECTOR => {
                module.types.insert(
                    operand(0)?,
                    Type::Vector {
                        component: operand(1)?,
                        count: operand(2)?,
                    },
                );
            }
            OP_TYPE_MATRIX => {
                module.types.insert(
                    operand(0)?,
                    Type::Matrix {
                        column: operand(1)?,
                        columns: operand(2)?,
                    },
                );
            }
            OP_TYPE_STRUCT => {
                module.types.insert(operand(0)?, Type::Other);
            }
            OP_TYPE_POINTER => {
                module.types.insert(
                    operand(0)?,
                    Type::Pointer {
                        storage: operand(1)?,
                        pointee: operand(2)?,
                    },
                );
            }
            OP_VARIABLE => {
                if operand(2)? == STORAGE_CLASS_INPUT {
                    module.input_variables.push((operand(1)?, operand(0)?));
                }
            }
            OP_DECORATE => match operand(1)? {
                DECORATION_LOCATION => {
                    module.locations.insert(operand(0)?, operand(2)?);
                }
                DECORATION_BUILT_IN => {
                    module.builtins.insert(operand(0)?);
                }
                _ => {}
            },
            OP_MEMBER_DECORATE => {
                if operand(2)? == DECORATION_BUILT_IN {
                    module.builtin_structs.insert(operand(0)?);
                }
            }
            _ => {}
        }

        cursor += word_count;
    }

    Ok(module)
}

/// Format and number of consecutive locations an input type occupies
fn resolve_format(module: &Module, type_id: u32) -> Option<(VertexFormat, u32)> {
    let scalar = |id: u32| match module.types.get(&id) {
        Some(Type::Scalar(scalar, 32)) => Some(*scalar),
        _ => None,
    };
    let vector = |id: u32| match module.types.get(&id) {
        Some(Type::Scalar(..)) => VertexFormat::from_scalar(scalar(id)?, 1),
        Some(Type::Vector { component, count }) => VertexFormat::from_scalar(scalar(*component)?, *count),
        _ => None,
    };

    match module.types.get(&type_id)? {
        Type::Matrix { column, columns } => Some((vector(*column)?, *columns)),
        _ => Some((vector(type_id)?, 1)),
    }
}

/// Vertex input bindings of a vertex-stage module.
///
/// Per-vertex attributes come first (binding 0), per-instance attributes follow
/// in the next binding. Attributes are packed tightly in location order; a matrix
/// input takes one location per column.
pub fn reflect_vertex_input_bindings(words: &[u32]) -> Result<Vec<VertexInputBinding>, ReflectError> {
    let module = parse(words)?;

    let mut per_vertex = Vec::new();
    let mut per_instance = Vec::new();
    let mut used: HashMap<u32, String> = HashMap::new();

    for &(id, pointer_type) in &module.input_variables {
        if let Some(interface) = &module.vertex_interface {
            if !interface.contains(&id) {
                continue;
            }
        }

        let pointee = match module.types.get(&pointer_type) {
            Some(Type::Pointer { storage, pointee }) if *storage == STORAGE_CLASS_INPUT => *pointee,
            _ => return Err(ReflectError::Malformed("input variable without an input pointer type")),
        };
        if module.builtins.contains(&id) || module.builtin_structs.contains(&pointee) {
            continue;
        }

        let name = module
            .names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("%{}", id));
        let location = *module
            .locations
            .get(&id)
            .ok_or_else(|| ReflectError::MissingLocation(name.clone()))?;
        let (format, slots) =
            resolve_format(&module, pointee).ok_or_else(|| ReflectError::UnsupportedType(name.clone()))?;

        let group = if is_per_instance(&name) {
            &mut per_instance
        } else {
            &mut per_vertex
        };

        for slot in 0..slots {
            let location = location
                .checked_add(slot)
                .ok_or(ReflectError::Malformed("location out of range"))?;
            if let Some(first) = used.insert(location, name.clone()) {
                return Err(ReflectError::DuplicateLocation {
                    location,
                    first,
                    second: name,
                });
            }
            group.push(VertexAttribute {
                name: name.clone(),
                location,
                format,
                offset: 0,
            });
        }
    }

    let mut bindings = Vec::new();
    for (attributes, input_rate) in [
        (per_vertex, vk::VertexInputRate::VERTEX),
        (per_instance, vk::VertexInputRate::INSTANCE),
    ] {
        if attributes.is_empty() {
            continue;
        }
        bindings.push(pack_binding(bindings.len() as u32, input_rate, attributes));
    }

    Ok(bindings)
}

fn pack_binding(
    binding: u32,
    input_rate: vk::VertexInputRate,
    mut attributes: Vec<VertexAttribute>,
) -> VertexInputBinding {
    attributes.sort_by_key(|attr| attr.location);
    let mut stride = 0;
    for attr in &mut attributes {
        attr.offset = stride;
        stride += attr.format.size();
    }
    VertexInputBinding {
        binding,
        input_rate,
        stride,
        attributes,
    }
}

/// Reinterpret a bytecode file's bytes as words
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>, ReflectError> {
    if bytes.len() % 4 != 0 {
        return Err(ReflectError::Malformed("length is not a multiple of 4"));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Minimal SPIR-V assembler for tests
#[cfg(test)]
pub(crate) mod test_spirv {
    use super::*;

    pub struct Input<'a> {
        pub name: &'a str,
        pub location: Option<u32>,
        pub ty: InputType,
    }

    #[derive(Clone, Copy)]
    pub enum InputType {
        Float(u32),
        Int(u32),
        Mat4,
        /// `gl_VertexIndex`-style built-in
        BuiltIn,
    }

    fn op(opcode: u32, operands: &[u32]) -> Vec<u32> {
        let mut words = vec![((operands.len() as u32 + 1) << 16) | opcode];
        words.extend_from_slice(operands);
        words
    }

    fn string(s: &str) -> Vec<u32> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Vertex module declaring `inputs`
    pub fn vertex_module(inputs: &[Input]) -> Vec<u32> {
        // Fixed type ids
        const FLOAT: u32 = 1;
        const INT: u32 = 2;
        const MAT4: u32 = 3;
        const MAIN: u32 = 4;
        const VEC_BASE: u32 = 10; // float vecN = 10 + n, int vecN = 20 + n
        const PTR_BASE: u32 = 40;
        const VAR_BASE: u32 = 100;

        let type_of = |ty: InputType| match ty {
            InputType::Float(1) | InputType::BuiltIn => FLOAT,
            InputType::Int(1) => INT,
            InputType::Float(n) => VEC_BASE + n,
            InputType::Int(n) => VEC_BASE + 10 + n,
            InputType::Mat4 => MAT4,
        };

        let vars: Vec<u32> = (0..inputs.len() as u32).map(|i| VAR_BASE + i).collect();

        let mut words = vec![SPIRV_MAGIC, 0x0001_0000, 0, 200, 0];

        let mut entry = vec![EXECUTION_MODEL_VERTEX, MAIN];
        entry.extend(string("main"));
        entry.extend(&vars);
        words.extend(op(OP_ENTRY_POINT, &entry));

        for (input, &var) in inputs.iter().zip(&vars) {
            let mut name = vec![var];
            name.extend(string(input.name));
            words.extend(op(OP_NAME, &name));
        }
        for (input, &var) in inputs.iter().zip(&vars) {
            if let Some(location) = input.location {
                words.extend(op(OP_DECORATE, &[var, DECORATION_LOCATION, location]));
            }
            if let InputType::BuiltIn = input.ty {
                words.extend(op(OP_DECORATE, &[var, DECORATION_BUILT_IN, 42]));
            }
        }

        words.extend(op(OP_TYPE_FLOAT, &[FLOAT, 32]));
        words.extend(op(OP_TYPE_INT, &[INT, 32, 1]));
        for n in 2..=4 {
            words.extend(op(OP_TYPE_VECTOR, &[VEC_BASE + n, FLOAT, n]));
            words.extend(op(OP_TYPE_VECTOR, &[VEC_BASE + 10 + n, INT, n]));
        }
        words.extend(op(OP_TYPE_MATRIX, &[MAT4, VEC_BASE + 4, 4]));

        for (i, (input, &var)) in inputs.iter().zip(&vars).enumerate() {
            let pointer = PTR_BASE + i as u32;
            words.extend(op(OP_TYPE_POINTER, &[pointer, STORAGE_CLASS_INPUT, type_of(input.ty)]));
            words.extend(op(OP_VARIABLE, &[pointer, var, STORAGE_CLASS_INPUT]));
        }

        words
    }

    pub fn input(name: &str, location: u32, ty: InputType) -> Input<'_> {
        Input {
            name,
            location: Some(location),
            ty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_spirv::{input, vertex_module, Input, InputType};
    use super::*;

    #[test]
    fn per_vertex_inputs_pack_in_location_order() {
        let words = vertex_module(&[
            input("a_color", 1, InputType::Float(4)),
            input("a_position", 0, InputType::Float(3)),
            input("a_uv", 2, InputType::Float(2)),
        ]);

        let bindings = reflect_vertex_input_bindings(&words).unwrap();
        assert_eq!(bindings.len(), 1);

        let binding = &bindings[0];
        assert_eq!(binding.binding, 0);
        assert_eq!(binding.input_rate, vk::VertexInputRate::VERTEX);
        assert_eq!(binding.stride, 12 + 16 + 8);

        let layout: Vec<_> = binding
            .attributes
            .iter()
            .map(|a| (a.name.as_str(), a.location, a.offset))
            .collect();
        assert_eq!(layout, [("a_position", 0, 0), ("a_color", 1, 12), ("a_uv", 2, 28)]);
    }

    #[test]
    fn instance_matrix_gets_its_own_binding() {
        let words = vertex_module(&[
            input("a_position", 0, InputType::Float(3)),
            input("i_transform", 1, InputType::Mat4),
            input("instance_id", 5, InputType::Int(1)),
        ]);

        let bindings = reflect_vertex_input_bindings(&words).unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].input_rate, vk::VertexInputRate::VERTEX);

        let instance = &bindings[1];
        assert_eq!(instance.binding, 1);
        assert_eq!(instance.input_rate, vk::VertexInputRate::INSTANCE);
        let locations: Vec<_> = instance.attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, [1, 2, 3, 4, 5]);
        assert_eq!(instance.stride, 4 * 16 + 4);
        assert_eq!(instance.attributes[4].format, VertexFormat::Int);
    }

    #[test]
    fn builtins_are_skipped() {
        let words = vertex_module(&[
            Input {
                name: "gl_VertexIndex",
                location: None,
                ty: InputType::BuiltIn,
            },
            input("a_position", 0, InputType::Float(2)),
        ]);

        let bindings = reflect_vertex_input_bindings(&words).unwrap();
        assert_eq!(bindings[0].attributes.len(), 1);
    }

    #[test]
    fn no_inputs_means_no_bindings() {
        assert!(reflect_vertex_input_bindings(&vertex_module(&[])).unwrap().is_empty());
    }

    #[test]
    fn duplicate_location_is_rejected() {
        let words = vertex_module(&[
            input("a_position", 0, InputType::Float(3)),
            input("a_normal", 0, InputType::Float(3)),
        ]);

        match reflect_vertex_input_bindings(&words) {
            Err(ReflectError::DuplicateLocation { location, .. }) => assert_eq!(location, 0),
            other => panic!("expected a duplicate location error, got {:?}", other),
        }
    }

    #[test]
    fn matrix_columns_collide_with_later_locations() {
        let words = vertex_module(&[
            input("i_model", 0, InputType::Mat4),
            input("i_tint", 2, InputType::Float(4)),
        ]);
        assert!(matches!(
            reflect_vertex_input_bindings(&words),
            Err(ReflectError::DuplicateLocation { location: 2, .. })
        ));
    }

    #[test]
    fn missing_location_is_rejected() {
        let words = vertex_module(&[Input {
            name: "a_position",
            location: None,
            ty: InputType::Float(3),
        }]);
        assert_eq!(
            reflect_vertex_input_bindings(&words),
            Err(ReflectError::MissingLocation("a_position".into()))
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            reflect_vertex_input_bindings(&[0xdead_beef, 0, 0, 0, 0]),
            Err(ReflectError::Malformed(_))
        ));
        assert!(matches!(spirv_words(&[1, 2, 3]), Err(ReflectError::Malformed(_))));
    }

    #[test]
    fn matrix_past_the_last_location_is_malformed() {
        let words = vertex_module(&[input("i_model", u32::MAX - 1, InputType::Mat4)]);
        assert_eq!(
            reflect_vertex_input_bindings(&words),
            Err(ReflectError::Malformed("location out of range"))
        );
    }

    #[test]
    fn instance_names() {
        assert!(is_per_instance("i_offset"));
        assert!(is_per_instance("InstanceColor"));
        assert!(is_per_instance("a_perInstanceData"));
        assert!(!is_per_instance("a_position"));
        assert!(!is_per_instance("index"));
    }
}
