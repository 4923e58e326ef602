//! Value types describing a series hierarchy: node paths, node kinds, element types,
//! scalars, attributes and dataset metadata.
//!
//! Backends address nodes by [`NodePath`] and report their [`NodeKind`]; everything the
//! walker needs to mirror a node is expressible with the types in this module.

use std::fmt;

/// Name of the mesh container inside an iteration.
pub const MESHES: &str = "meshes";
/// Name of the particle container inside an iteration.
pub const PARTICLES: &str = "particles";
/// Name of the patch sub-tree inside a particle species.
pub const PARTICLE_PATCHES: &str = "particlePatches";
/// Root attribute holding the writer's rank directory.
pub const RANK_META_ATTRIBUTE: &str = "rankMetaInfo";

/// Location of a node relative to the series root.
///
/// The first segment is always the iteration index. Rendered as `/data/<iteration>/...`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodePath {
    segments: Vec<String>,
}

impl NodePath {
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn iteration(index: u64) -> Self {
        Self {
            segments: vec![index.to_string()],
        }
    }

    #[must_use]
    pub fn join(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self { segments }
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Iteration index this path lives under, if any.
    #[must_use]
    pub fn iteration_index(&self) -> Option<u64> {
        self.segments.first().and_then(|s| s.parse().ok())
    }

    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let (_, parent) = self.segments.split_last()?;
        Some(Self {
            segments: parent.to_vec(),
        })
    }

    /// Last path segment.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/data")?;
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// Flavors of named containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    /// The `meshes` container of an iteration.
    Meshes,
    /// The `particles` container of an iteration.
    Particles,
    /// A mesh, holding mesh record components.
    Mesh,
    /// A particle species, holding records and optionally a patch sub-tree.
    ParticleSpecies,
    /// A particle record, holding record components.
    Record,
    /// The `particlePatches` sub-tree of a species.
    ParticlePatches,
    /// A patch record, holding patch record components.
    PatchRecord,
}

/// Variant of a hierarchy node.
///
/// `Foreign` carries node kinds reported by a backend that this crate does not know how
/// to copy; the walker rejects them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    Series,
    Iteration,
    Container(ContainerKind),
    RecordComponent,
    PatchRecordComponent,
    Foreign(String),
}

impl NodeKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::Series => "series",
            NodeKind::Iteration => "iteration",
            NodeKind::Container(ContainerKind::Meshes) => "meshes",
            NodeKind::Container(ContainerKind::Particles) => "particles",
            NodeKind::Container(ContainerKind::Mesh) => "mesh",
            NodeKind::Container(ContainerKind::ParticleSpecies) => "particle_species",
            NodeKind::Container(ContainerKind::Record) => "record",
            NodeKind::Container(ContainerKind::ParticlePatches) => "particle_patches",
            NodeKind::Container(ContainerKind::PatchRecord) => "patch_record",
            NodeKind::RecordComponent => "record_component",
            NodeKind::PatchRecordComponent => "patch_record_component",
            NodeKind::Foreign(name) => name,
        }
    }
}

impl From<String> for NodeKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "series" => NodeKind::Series,
            "iteration" => NodeKind::Iteration,
            "meshes" => NodeKind::Container(ContainerKind::Meshes),
            "particles" => NodeKind::Container(ContainerKind::Particles),
            "mesh" => NodeKind::Container(ContainerKind::Mesh),
            "particle_species" => NodeKind::Container(ContainerKind::ParticleSpecies),
            "record" => NodeKind::Container(ContainerKind::Record),
            "particle_patches" => NodeKind::Container(ContainerKind::ParticlePatches),
            "patch_record" => NodeKind::Container(ContainerKind::PatchRecord),
            "record_component" => NodeKind::RecordComponent,
            "patch_record_component" => NodeKind::PatchRecordComponent,
            _ => NodeKind::Foreign(name),
        }
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! numeric_types {
    ($($variant:ident($ty:ty) => $name:literal),* $(,)?) => {
        /// Element type of a dataset or of a numeric attribute.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        pub enum Datatype {
            $(#[serde(rename = $name)] $variant,)*
        }

        /// A single typed value.
        #[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
        #[serde(tag = "type", content = "value")]
        pub enum Scalar {
            $(#[serde(rename = $name)] $variant($ty),)*
        }

        impl Datatype {
            /// Size of one element in bytes.
            #[must_use]
            pub fn size(self) -> usize {
                match self {
                    $(Datatype::$variant => std::mem::size_of::<$ty>(),)*
                }
            }

            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Datatype::$variant => $name,)*
                }
            }
        }

        impl Scalar {
            #[must_use]
            pub fn datatype(&self) -> Datatype {
                match self {
                    $(Scalar::$variant(_) => Datatype::$variant,)*
                }
            }

            /// Little-endian encoding, `datatype().size()` bytes long.
            #[must_use]
            pub fn to_le_bytes(&self) -> Vec<u8> {
                match self {
                    $(Scalar::$variant(v) => v.to_le_bytes().to_vec(),)*
                }
            }

            /// Decodes one element; `None` if `bytes` is not exactly one element long.
            #[must_use]
            pub fn from_le_bytes(dtype: Datatype, bytes: &[u8]) -> Option<Scalar> {
                match dtype {
                    $(Datatype::$variant => Some(Scalar::$variant(<$ty>::from_le_bytes(bytes.try_into().ok()?))),)*
                }
            }
        }
    };
}

numeric_types! {
    Int8(i8) => "int8",
    Int16(i16) => "int16",
    Int32(i32) => "int32",
    Int64(i64) => "int64",
    UInt8(u8) => "uint8",
    UInt16(u16) => "uint16",
    UInt32(u32) => "uint32",
    UInt64(u64) => "uint64",
    Float32(f32) => "float32",
    Float64(f64) => "float64",
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Scalar(Datatype),
    Array(Datatype),
    Bool,
    String,
    StringArray,
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeType::Scalar(dtype) => write!(f, "{dtype}"),
            AttributeType::Array(dtype) => write!(f, "vec_{dtype}"),
            AttributeType::Bool => f.write_str("bool"),
            AttributeType::String => f.write_str("string"),
            AttributeType::StringArray => f.write_str("vec_string"),
        }
    }
}

/// Typed metadata value attached to a node. The variant is the declared type.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Attribute {
    Scalar(Scalar),
    /// Homogeneous array; `dtype` survives even when `values` is empty.
    Array {
        dtype: Datatype,
        values: Vec<Scalar>,
    },
    Bool(bool),
    String(String),
    StringArray(Vec<String>),
}

impl Attribute {
    #[must_use]
    pub fn datatype(&self) -> AttributeType {
        match self {
            Attribute::Scalar(value) => AttributeType::Scalar(value.datatype()),
            Attribute::Array { dtype, .. } => AttributeType::Array(*dtype),
            Attribute::Bool(_) => AttributeType::Bool,
            Attribute::String(_) => AttributeType::String,
            Attribute::StringArray(_) => AttributeType::StringArray,
        }
    }
}

/// How a dataset stores its values.
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetLayout {
    /// No values: the dataset was declared but never written.
    Empty,
    /// One value broadcast over the whole shape.
    Constant(Scalar),
    /// Values stored in chunks, see [`crate::chunk::ChunkTable`].
    Chunked,
}

/// Dataset metadata as reported by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetInfo {
    pub dtype: Datatype,
    pub shape: Vec<u64>,
    pub layout: DatasetLayout,
}

impl DatasetInfo {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self.layout, DatasetLayout::Empty) || self.shape.contains(&0)
    }

    /// Number of elements in the dataset, saturating.
    #[must_use]
    pub fn volume(&self) -> u64 {
        crate::chunk::volume(&self.shape)
    }
}
