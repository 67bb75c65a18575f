/// Texture units tracked per queue. Well below any GL minimum, and more
/// than the shader library ever binds at once.
pub const MAX_TEXTURE_SLOTS: usize = 16;

/// One tracked texture unit.
#[derive(Clone, Copy, Debug)]
pub struct TextureSlot {
    pub id: u32,
    /// Needs (re)binding at the next draw close.
    pub changed: bool,
    /// Never bound this frame; `id` is meaningless.
    pub initial: bool,
}

impl Default for TextureSlot {
    fn default() -> Self {
        Self {
            id: 0,
            changed: false,
            initial: true,
        }
    }
}

/// Desired GL attachment state, recorded eagerly and resolved lazily.
/// Rebinding the texture a unit already holds is tracked as a no-op so
/// the redundant call never reaches the driver; the framebuffer needs no
/// flag since draws capture it by value when they close.
#[derive(Clone, Debug, Default)]
pub struct Attachments {
    pub framebuffer: u32,
    pub textures: [TextureSlot; MAX_TEXTURE_SLOTS],
}

impl Attachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_framebuffer(&mut self, id: u32) {
        self.framebuffer = id;
    }

    pub fn bind_texture(&mut self, slot: usize, id: u32) {
        assert!(slot < MAX_TEXTURE_SLOTS, "texture slot {slot} out of range");
        let tex = &mut self.textures[slot];
        if tex.initial || tex.id != id {
            tex.id = id;
            tex.changed = true;
            tex.initial = false;
        }
    }

    /// Forgets all texture bindings; next frame starts from scratch.
    pub fn reset_textures(&mut self) {
        self.textures = [TextureSlot::default(); MAX_TEXTURE_SLOTS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebinding_the_same_texture_is_not_a_change() {
        let mut att = Attachments::new();
        att.bind_texture(0, 5);
        assert!(att.textures[0].changed);
        att.textures[0].changed = false;

        att.bind_texture(0, 5);
        assert!(!att.textures[0].changed);

        att.bind_texture(0, 6);
        assert!(att.textures[0].changed);
    }

    #[test]
    fn reset_makes_every_slot_initial_again() {
        let mut att = Attachments::new();
        att.bind_texture(2, 9);
        att.reset_textures();
        assert!(att.textures[2].initial);

        // Binding id 0 to a reset slot is still a change; the slot has no
        // known binding to compare against.
        att.bind_texture(2, 0);
        assert!(att.textures[2].changed);
    }

}
