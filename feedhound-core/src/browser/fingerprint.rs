use crate::config::FingerprintSection;

/// Builds the init scripts that normalize the most commonly probed
/// automation tells. Scripts run before any page script via
/// `Page.addScriptToEvaluateOnNewDocument`.
#[derive(Debug, Clone)]
pub struct FingerprintMasker {
    config: FingerprintSection,
    lang: Option<String>,
}

impl FingerprintMasker {
    pub fn new(config: FingerprintSection, lang: Option<String>) -> Self {
        Self { config, lang }
    }

    pub fn scripts(&self) -> Vec<String> {
        let mut scripts = Vec::new();
        if self.config.hide_webdriver {
            scripts.push(Self::webdriver_script());
        }
        if let Some(lang) = &self.lang {
            scripts.push(Self::languages_script(lang));
        }
        if self.config.enable_webgl_mask {
            scripts.push(self.webgl_script());
        }
        if self.config.enable_canvas_noise {
            scripts.push(self.canvas_script());
        }
        scripts
    }

    fn webdriver_script() -> String {
        r#"
        (() => {
            Object.defineProperty(Navigator.prototype, 'webdriver', { get: () => undefined });
            if (!window.chrome) {
                window.chrome = { runtime: {} };
            }
        })();
        "#
        .to_string()
    }

    fn languages_script(lang: &str) -> String {
        let lang = escape_js(lang);
        format!(
            "Object.defineProperty(navigator, 'language', {{ get: () => '{lang}' }});\n\
             Object.defineProperty(navigator, 'languages', {{ get: () => ['{lang}', 'en'] }});"
        )
    }

    fn webgl_script(&self) -> String {
        let vendor = escape_js(self.config.webgl_vendor.as_deref().unwrap_or("Intel Inc."));
        let renderer = escape_js(
            self.config
                .webgl_renderer
                .as_deref()
                .unwrap_or("Intel Iris OpenGL Engine"),
        );
        format!(
            r#"
            (() => {{
                const spoof = (proto) => {{
                    if (!proto || !proto.getParameter) {{
                        return;
                    }}
                    const original = proto.getParameter;
                    proto.getParameter = function(param) {{
                        if (param === 37445) {{
                            return '{vendor}';
                        }}
                        if (param === 37446) {{
                            return '{renderer}';
                        }}
                        return original.apply(this, arguments);
                    }};
                }};
                spoof(window.WebGLRenderingContext && WebGLRenderingContext.prototype);
                spoof(window.WebGL2RenderingContext && WebGL2RenderingContext.prototype);
            }})();
            "#
        )
    }

    fn canvas_script(&self) -> String {
        let [min, max] = self.config.canvas_noise_range;
        let (min, max) = (min.min(max), min.max(max));
        format!(
            r#"
            (() => {{
                const original = HTMLCanvasElement.prototype.toDataURL;
                HTMLCanvasElement.prototype.toDataURL = function() {{
                    try {{
                        const ctx = this.getContext('2d');
                        if (ctx && this.width && this.height) {{
                            const image = ctx.getImageData(0, 0, this.width, this.height);
                            for (let i = 0; i < image.data.length; i += 4) {{
                                const delta = Math.floor(Math.random() * ({max} - {min} + 1)) + {min};
                                image.data[i] = Math.min(255, Math.max(0, image.data[i] + delta));
                            }}
                            ctx.putImageData(image, 0, 0);
                        }}
                    }} catch (_) {{}}
                    return original.apply(this, arguments);
                }};
            }})();
            "#
        )
    }
}

fn escape_js(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
