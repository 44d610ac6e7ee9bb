//! EC2-shaped handlers: instances, volumes, addresses, images, launch
//! templates, tags, availability zones.

pub mod addresses;
pub mod az;
pub mod images;
pub mod instances;
pub mod launch_templates;
pub mod tags;
pub mod volumes;
