use crate::chunk::Chunk;
use crate::hierarchy::{
    Attribute, ContainerKind, Datatype, MESHES, NodeKind, PARTICLE_PATCHES, PARTICLES, Scalar,
};
use crate::memory::{Dataset, Node, SeriesData};

pub fn int_values(count: u64) -> Vec<Scalar> {
    (0..count as i32).map(Scalar::Int32).collect()
}

pub fn component(dataset: Dataset) -> Node {
    Node::new(NodeKind::RecordComponent).with_dataset(dataset)
}

pub fn container(kind: ContainerKind) -> Node {
    Node::new(NodeKind::Container(kind))
}

/// Iteration 0 holding `meshes/E/x`, an int32 dataset of `shape` filled with 0, 1, 2, ...
/// written as `chunks` (one whole chunk from rank 0 if empty).
pub fn mesh_series(shape: &[u64], chunks: Vec<Chunk>) -> SeriesData {
    let volume = shape.iter().product();
    let dataset = Dataset::dense(Datatype::Int32, shape, &int_values(volume), chunks).unwrap();
    let mesh = container(ContainerKind::Mesh)
        .with_attribute("unitSI", Attribute::Scalar(Scalar::Float64(1.0)))
        .with_attribute("axisLabels", Attribute::StringArray(vec!["x".into(); shape.len()]))
        .with_child("x", component(dataset));
    let mut data = SeriesData::default();
    data.attributes
        .insert("openPMD".into(), Attribute::String("1.1.0".into()));
    data.iterations.insert(
        0,
        Node::new(NodeKind::Iteration)
            .with_attribute("time", Attribute::Scalar(Scalar::Float32(0.0)))
            .with_child(MESHES, container(ContainerKind::Meshes).with_child("E", mesh)),
    );
    data
}

/// Two iterations with meshes (chunked, constant and empty components) and one particle
/// species with a patch sub-tree.
pub fn full_series() -> SeriesData {
    let mut data = SeriesData::default();
    data.attributes
        .insert("author".into(), Attribute::String("test".into()));
    for index in [0, 10] {
        let meshes = container(ContainerKind::Meshes).with_child(
            "B",
            container(ContainerKind::Mesh)
                .with_child(
                    "x",
                    component(
                        Dataset::dense(
                            Datatype::Int32,
                            &[6],
                            &int_values(6),
                            vec![
                                Chunk::new(vec![0], vec![3], 0),
                                Chunk::new(vec![3], vec![3], 1),
                            ],
                        )
                        .unwrap(),
                    ),
                )
                .with_child(
                    "y",
                    component(Dataset::constant(Scalar::Float64(2.5), &[6])),
                )
                .with_child("z", component(Dataset::empty(Datatype::Float64, &[0]))),
        );
        let patches = container(ContainerKind::ParticlePatches).with_child(
            "numParticles",
            container(ContainerKind::PatchRecord).with_child(
                "value",
                Node::new(NodeKind::PatchRecordComponent).with_dataset(
                    Dataset::dense(
                        Datatype::UInt64,
                        &[2],
                        &[Scalar::UInt64(3), Scalar::UInt64(1)],
                        vec![],
                    )
                    .unwrap(),
                ),
            ),
        );
        let electrons = container(ContainerKind::ParticleSpecies)
            .with_attribute("charge", Attribute::Scalar(Scalar::Float64(-1.0)))
            .with_child(
                "position",
                container(ContainerKind::Record).with_child(
                    "x",
                    component(
                        Dataset::dense(
                            Datatype::Float32,
                            &[4],
                            &[0.5f32, 1.5, 2.5, 3.5].map(Scalar::Float32),
                            vec![],
                        )
                        .unwrap(),
                    ),
                ),
            )
            .with_child(PARTICLE_PATCHES, patches);
        data.iterations.insert(
            index,
            Node::new(NodeKind::Iteration)
                .with_child(MESHES, meshes)
                .with_child(
                    PARTICLES,
                    container(ContainerKind::Particles).with_child("electrons", electrons),
                ),
        );
    }
    data
}
