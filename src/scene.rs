use crate::geometry::{Mesh, ObjectGeometry, Vertex};
use bytemuck::{Pod, Zeroable};
use glam::{Affine3A, Quat, Vec3};

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaterialKind {
    Diffuse = 0,
    Mirror = 1,
    Refractive = 2,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Material {
    pub color: [f32; 4],
    pub params: [f32; 4], // x: kind, y: index of refraction
}

impl Material {
    pub fn new(kind: MaterialKind, color: [f32; 3], ior: f32) -> Self {
        Self {
            color: [color[0], color[1], color[2], 1.0],
            params: [kind as u32 as f32, ior, 0.0, 0.0],
        }
    }

    pub fn diffuse(color: [f32; 3]) -> Self {
        Self::new(MaterialKind::Diffuse, color, 1.0)
    }

    pub fn kind(&self) -> MaterialKind {
        match self.params[0] as u32 {
            1 => MaterialKind::Mirror,
            2 => MaterialKind::Refractive,
            _ => MaterialKind::Diffuse,
        }
    }
}

/// Per-object record read by the closest-hit shader, indexed by the
/// instance custom index.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ObjectDesc {
    pub vertex_address: u64,
    pub index_address: u64,
    pub material: Material,
}

/// Circular path around `center` in the XZ plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Orbit {
    pub center: Vec3,
    pub radius: f32,
    pub phase: f32,
}

pub struct SceneObject {
    pub mesh_index: usize,
    pub transform: Affine3A,
    pub material: Material,
    /// Animated objects replace the translation of `transform` every frame.
    pub orbit: Option<Orbit>,
}

pub struct Scene {
    pub meshes: Vec<Mesh>,
    pub objects: Vec<SceneObject>,
    /// Radians per second.
    pub orbit_speed: f32,
}

impl Scene {
    pub fn new(orbit_speed: f32) -> Self {
        let cube = create_cube();
        let sphere = create_sphere(32, 16);

        let objects = vec![
            // Ground
            SceneObject {
                mesh_index: 0,
                transform: Affine3A::from_scale_rotation_translation(
                    Vec3::new(20.0, 0.1, 20.0),
                    Quat::IDENTITY,
                    Vec3::new(0.0, -0.05, 0.0),
                ),
                material: Material::diffuse([0.5, 0.5, 0.5]),
                orbit: None,
            },
            // Mirror ball in the middle
            SceneObject {
                mesh_index: 1,
                transform: Affine3A::from_scale_rotation_translation(
                    Vec3::splat(2.0),
                    Quat::IDENTITY,
                    Vec3::new(0.0, 1.0, 0.0),
                ),
                material: Material::new(MaterialKind::Mirror, [0.95, 0.95, 0.95], 1.0),
                orbit: None,
            },
            // Orbiting cube
            SceneObject {
                mesh_index: 0,
                transform: Affine3A::from_translation(Vec3::new(3.0, 0.5, 0.0)),
                material: Material::diffuse([0.8, 0.3, 0.2]),
                orbit: Some(Orbit {
                    center: Vec3::new(0.0, 0.5, 0.0),
                    radius: 3.0,
                    phase: 0.0,
                }),
            },
            // Glass ball
            SceneObject {
                mesh_index: 1,
                transform: Affine3A::from_scale_rotation_translation(
                    Vec3::splat(1.2),
                    Quat::IDENTITY,
                    Vec3::new(-3.0, 0.6, 2.5),
                ),
                material: Material::new(MaterialKind::Refractive, [1.0, 1.0, 1.0], 1.5),
                orbit: None,
            },
        ];

        Self {
            meshes: vec![cube, sphere],
            objects,
            orbit_speed,
        }
    }

    /// World transform of every object at `time` seconds. Object order is
    /// stable, so index `i` always belongs to instance `i`.
    pub fn transforms(&self, time: f32) -> Vec<Affine3A> {
        self.objects
            .iter()
            .map(|object| match object.orbit {
                Some(orbit) => {
                    let angle = orbit.phase + time * self.orbit_speed;
                    let offset = Vec3::new(angle.cos(), 0.0, angle.sin()) * orbit.radius;
                    Affine3A::from_rotation_translation(Quat::from_rotation_y(-angle), orbit.center + offset)
                }
                None => object.transform,
            })
            .collect()
    }

    /// Shader-side description of each object, given where its mesh landed
    /// in the shared geometry buffers.
    pub fn object_descs(&self, geometry: &[ObjectGeometry]) -> Vec<ObjectDesc> {
        self.objects
            .iter()
            .map(|object| {
                let mesh = &geometry[object.mesh_index];
                ObjectDesc {
                    vertex_address: mesh.vertex_address,
                    index_address: mesh.index_address,
                    material: object.material,
                }
            })
            .collect()
    }
}

pub fn create_cube() -> Mesh {
    let vertices = vec![
        // Front
        Vertex { pos: [-0.5, -0.5,  0.5], nrm: [ 0.0,  0.0,  1.0] },
        Vertex { pos: [ 0.5, -0.5,  0.5], nrm: [ 0.0,  0.0,  1.0] },
        Vertex { pos: [ 0.5,  0.5,  0.5], nrm: [ 0.0,  0.0,  1.0] },
        Vertex { pos: [-0.5,  0.5,  0.5], nrm: [ 0.0,  0.0,  1.0] },
        // Back
        Vertex { pos: [-0.5, -0.5, -0.5], nrm: [ 0.0,  0.0, -1.0] },
        Vertex { pos: [-0.5,  0.5, -0.5], nrm: [ 0.0,  0.0, -1.0] },
        Vertex { pos: [ 0.5,  0.5, -0.5], nrm: [ 0.0,  0.0, -1.0] },
        Vertex { pos: [ 0.5, -0.5, -0.5], nrm: [ 0.0,  0.0, -1.0] },
        // Top
        Vertex { pos: [-0.5,  0.5, -0.5], nrm: [ 0.0,  1.0,  0.0] },
        Vertex { pos: [-0.5,  0.5,  0.5], nrm: [ 0.0,  1.0,  0.0] },
        Vertex { pos: [ 0.5,  0.5,  0.5], nrm: [ 0.0,  1.0,  0.0] },
        Vertex { pos: [ 0.5,  0.5, -0.5], nrm: [ 0.0,  1.0,  0.0] },
        // Bottom
        Vertex { pos: [-0.5, -0.5, -0.5], nrm: [ 0.0, -1.0,  0.0] },
        Vertex { pos: [ 0.5, -0.5, -0.5], nrm: [ 0.0, -1.0,  0.0] },
        Vertex { pos: [ 0.5, -0.5,  0.5], nrm: [ 0.0, -1.0,  0.0] },
        Vertex { pos: [-0.5, -0.5,  0.5], nrm: [ 0.0, -1.0,  0.0] },
        // Right
        Vertex { pos: [ 0.5, -0.5, -0.5], nrm: [ 1.0,  0.0,  0.0] },
        Vertex { pos: [ 0.5,  0.5, -0.5], nrm: [ 1.0,  0.0,  0.0] },
        Vertex { pos: [ 0.5,  0.5,  0.5], nrm: [ 1.0,  0.0,  0.0] },
        Vertex { pos: [ 0.5, -0.5,  0.5], nrm: [ 1.0,  0.0,  0.0] },
        // Left
        Vertex { pos: [-0.5, -0.5, -0.5], nrm: [-1.0,  0.0,  0.0] },
        Vertex { pos: [-0.5, -0.5,  0.5], nrm: [-1.0,  0.0,  0.0] },
        Vertex { pos: [-0.5,  0.5,  0.5], nrm: [-1.0,  0.0,  0.0] },
        Vertex { pos: [-0.5,  0.5, -0.5], nrm: [-1.0,  0.0,  0.0] },
    ];
    let indices = vec![
        0, 1, 2, 0, 2, 3,
        4, 5, 6, 4, 6, 7,
        8, 9, 10, 8, 10, 11,
        12, 13, 14, 12, 14, 15,
        16, 17, 18, 16, 18, 19,
        20, 21, 22, 20, 22, 23,
    ];
    Mesh { vertices, indices }
}

/// Unit-diameter UV sphere centred on the origin.
pub fn create_sphere(slices: u32, stacks: u32) -> Mesh {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();

    for i in 0..=stacks {
        let v = i as f32 / stacks as f32;
        let phi = v * std::f32::consts::PI;

        for j in 0..=slices {
            let u = j as f32 / slices as f32;
            let theta = u * std::f32::consts::PI * 2.0;

            let x = theta.cos() * phi.sin();
            let y = phi.cos();
            let z = theta.sin() * phi.sin();

            vertices.push(Vertex {
                pos: [x * 0.5, y * 0.5, z * 0.5],
                nrm: [x, y, z],
            });
        }
    }

    for i in 0..stacks {
        for j in 0..slices {
            let first = (i * (slices + 1)) + j;
            let second = first + slices + 1;

            indices.push(first);
            indices.push(second);
            indices.push(first + 1);

            indices.push(second);
            indices.push(second + 1);
            indices.push(first + 1);
        }
    }
    Mesh { vertices, indices }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_is_unit_and_closed() {
        let cube = create_cube();
        assert_eq!(cube.vertex_count(), 24);
        assert_eq!(cube.triangle_count(), 12);
        cube.validate(0).unwrap();

        let bounds = cube.bounds();
        assert_eq!(bounds.min, Vec3::splat(-0.5));
        assert_eq!(bounds.max, Vec3::splat(0.5));
    }

    #[test]
    fn sphere_indices_stay_in_range() {
        let sphere = create_sphere(8, 4);
        assert_eq!(sphere.vertex_count(), 9 * 5);
        assert_eq!(sphere.triangle_count(), 8 * 4 * 2);
        sphere.validate(1).unwrap();
        assert!(sphere.bounds().max.x <= 0.5 + f32::EPSILON);
    }

    #[test]
    fn only_the_orbiting_object_moves() {
        let scene = Scene::new(1.0);
        let before = scene.transforms(0.0);
        let after = scene.transforms(0.5);

        let moved: Vec<usize> = (0..before.len()).filter(|&i| before[i] != after[i]).collect();
        assert_eq!(moved, vec![2]);
    }

    #[test]
    fn orbit_keeps_its_radius() {
        let scene = Scene::new(0.6);
        for t in [0.0, 1.0, 2.5, 10.0] {
            let position = Vec3::from(scene.transforms(t)[2].translation);
            let orbit = scene.objects[2].orbit.unwrap();
            assert!(((position - orbit.center).length() - orbit.radius).abs() < 1e-4);
            assert_eq!(position.y, orbit.center.y);
        }
    }

    #[test]
    fn object_descs_follow_mesh_and_material() {
        let scene = Scene::new(0.6);
        let geometry: Vec<ObjectGeometry> = (0..2u64)
            .map(|i| ObjectGeometry {
                vertex_offset: 0,
                index_offset: 0,
                vertex_address: 0x1000 * (i + 1),
                index_address: 0x8000 * (i + 1),
                vertex_count: 0,
                triangle_count: 0,
            })
            .collect();

        let descs = scene.object_descs(&geometry);
        assert_eq!(descs.len(), 4);
        assert_eq!(descs[1].vertex_address, 0x2000);
        assert_eq!(descs[1].material.kind(), MaterialKind::Mirror);
        assert_eq!(descs[3].material.kind(), MaterialKind::Refractive);
        assert_eq!(descs[3].material.params[1], 1.5);
        assert_eq!(std::mem::size_of::<ObjectDesc>(), 48);
    }
}
