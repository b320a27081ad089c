//! Host-side API tests: everything here runs without a Vulkan device.

use graphite::ids::{DescriptorSetName, RenderTargetId, UniformId};
use graphite::resource::{
    AttachmentDesc, AttachmentRef, BufferDesc, ImageDesc, RenderPassDesc, SamplerDesc,
    SubpassDesc,
};
use graphite::{vk, QueueKind, QueueKindMask, SubRange};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn string_ids_compare_by_content() {
    init_tracing();
    let a = UniformId::new("u_scene");
    let b = UniformId::new("u_scene");
    let c = UniformId::new("u_scene2");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.as_str(), "u_scene");
    assert!(a.is_defined());
    assert!(!UniformId::default().is_defined());

    // hashes are stable across id kinds sharing the representation
    assert_eq!(
        UniformId::new("shadow").hash_value(),
        RenderTargetId::new("shadow").hash_value()
    );
    let _set: DescriptorSetName = "PerView".into();
}

#[test]
fn queue_kind_masks() {
    let mask = QueueKindMask::from(QueueKind::AsyncCompute) | QueueKindMask::GRAPHICS;
    assert!(mask.contains(QueueKindMask::GRAPHICS));
    assert!(mask.contains(QueueKindMask::ASYNC_COMPUTE));
    assert!(!mask.contains(QueueKindMask::ASYNC_TRANSFER));
    assert_eq!(QueueKindMask::default(), QueueKindMask::GRAPHICS);
}

#[test]
fn format_helpers() {
    assert_eq!(graphite::format_texel_size(vk::Format::R8G8B8A8_UNORM), Some(4));
    assert_eq!(
        graphite::format_texel_size(vk::Format::R32G32B32A32_SFLOAT),
        Some(16)
    );
    assert_eq!(graphite::format_texel_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    assert_eq!(
        graphite::format_aspect_mask(vk::Format::D32_SFLOAT_S8_UINT),
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    );
    assert_eq!(graphite::get_mip_level_count(800, 600), 10);
}

#[test]
fn image_desc_helpers() {
    let desc = ImageDesc::new_2d(
        vk::Format::R8G8B8A8_UNORM,
        800,
        600,
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
    );
    assert_eq!(desc.extent().width, 800);
    assert_eq!(desc.mip_levels, 1);
    assert_eq!(desc.image_type, vk::ImageType::TYPE_2D);

    let buffer = BufferDesc {
        byte_size: 256 * 1024,
        usage: vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::STORAGE_BUFFER,
        map_on_create: false,
    };
    assert_eq!(buffer, buffer);
}

#[test]
fn sampler_descs_are_structurally_comparable() {
    let s1 = SamplerDesc {
        address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        ..Default::default()
    };
    let s2 = SamplerDesc {
        address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        ..Default::default()
    };
    let s3 = SamplerDesc {
        address_mode_u: vk::SamplerAddressMode::REPEAT,
        ..Default::default()
    };
    assert_eq!(s1, s2);
    assert_ne!(s1, s3);
}

#[test]
fn render_pass_descs_compare_structurally() {
    let pass = |load_op| RenderPassDesc {
        attachments: vec![AttachmentDesc {
            format: vk::Format::R8G8B8A8_UNORM,
            load_op,
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ..Default::default()
        }],
        subpasses: vec![SubpassDesc {
            color_attachments: vec![AttachmentRef {
                attachment: 0,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            }],
            ..Default::default()
        }],
        dependencies: vec![],
    };
    assert_eq!(
        pass(vk::AttachmentLoadOp::CLEAR),
        pass(vk::AttachmentLoadOp::CLEAR)
    );
    assert_ne!(
        pass(vk::AttachmentLoadOp::CLEAR),
        pass(vk::AttachmentLoadOp::LOAD)
    );
}

#[test]
fn subresource_ranges() {
    let whole = SubRange::whole(10, 6);
    assert_eq!(whole.base_mip, 0);
    assert_eq!(whole.mip_count, 10);
    assert_eq!(whole.layer_count, 6);
    let one = SubRange::mip(3);
    assert_eq!((one.base_mip, one.mip_count), (3, 1));
}

#[test]
fn errors_render_readably() {
    let err = graphite::Error::MissingUsage {
        name: "target".to_string(),
        required: "TRANSFER_SRC",
    };
    assert_eq!(err.to_string(), "`target` is missing usage flag TRANSFER_SRC");

    let err = graphite::Error::SlotTableFull { kind: "image" };
    assert!(err.to_string().contains("image"));

    let err = graphite::Error::Poisoned;
    assert!(err.to_string().contains("poisoned"));
}
